use std::time::Duration;
use tokio::time::Instant;

/// Default gap between forwarded video frames (about 3 fps).
pub const DEFAULT_VIDEO_INTERVAL: Duration = Duration::from_millis(333);

/// Minimum-interval gate for outgoing frames. Frames arriving too soon are
/// dropped, never queued.
///
/// Checking and recording are separate so the caller only consumes the slot
/// once the frame was actually handed to the transport.
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    interval: Duration,
    last_accepted: Option<Instant>,
}

impl Default for FrameThrottle {
    fn default() -> Self {
        Self::new(DEFAULT_VIDEO_INTERVAL)
    }
}

impl FrameThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_accepted: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn would_accept(&self, now: Instant) -> bool {
        match self.last_accepted {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_accepted = Some(now);
    }

    /// Check and record in one step.
    pub fn try_accept(&mut self, now: Instant) -> bool {
        if self.would_accept(now) {
            self.record(now);
            true
        } else {
            false
        }
    }

    pub fn reset(&mut self) {
        self.last_accepted = None;
    }
}
