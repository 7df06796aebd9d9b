//! Frame accounting for one capture run.
//!
//! The capture reader and the realtime branch of the consumer both report
//! into the same [`FrameStats`], so one snapshot tells how many camera frames
//! were produced, how many made it upstream, and where the rest stopped.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Where a camera frame stopped short of the realtime endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDrop {
    /// A previous frame still held the in-flight slot.
    InFlight,
    /// The dispatch thread was backed up.
    QueueFull,
    /// No active realtime session.
    Inactive,
    /// Inside the video send interval.
    Throttled,
    /// Encoding or queueing on the transport failed.
    SendFailed,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    sent: AtomicU64,
    sent_bytes: AtomicU64,
    in_flight: AtomicU64,
    queue_full: AtomicU64,
    inactive: AtomicU64,
    throttled: AtomicU64,
    send_failed: AtomicU64,
}

impl Counters {
    fn slot(&self, cause: FrameDrop) -> &AtomicU64 {
        match cause {
            FrameDrop::InFlight => &self.in_flight,
            FrameDrop::QueueFull => &self.queue_full,
            FrameDrop::Inactive => &self.inactive,
            FrameDrop::Throttled => &self.throttled,
            FrameDrop::SendFailed => &self.send_failed,
        }
    }
}

/// Shared counters. Cheap to update from the camera callback thread.
#[derive(Debug)]
pub struct FrameStats {
    counters: Counters,
    run_start: Mutex<Instant>,
    last_delivery: Mutex<Option<Instant>>,
}

/// Per-cause drop counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DropCounts {
    pub in_flight: u64,
    pub queue_full: u64,
    pub inactive: u64,
    pub throttled: u64,
    pub send_failed: u64,
}

impl DropCounts {
    /// Frames the capture side never handed to the consumer.
    pub fn at_capture(&self) -> u64 {
        self.in_flight + self.queue_full
    }

    /// Frames the consumer had but did not send upstream.
    pub fn upstream(&self) -> u64 {
        self.inactive + self.throttled + self.send_failed
    }
}

/// Point-in-time view of a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameReport {
    /// Frames handed to the consumer per second.
    pub fps: f64,
    pub delivered: u64,
    /// JPEG frames queued on the realtime transport.
    pub sent: u64,
    pub dropped: DropCounts,
    /// Share of camera frames lost before the consumer, in percent.
    pub capture_drop_rate: f64,
    /// Encoded video bytes per second sent upstream.
    pub upload_bps: u64,
    /// Milliseconds since the last delivered frame.
    pub last_frame_age_ms: Option<u64>,
}

impl FrameStats {
    pub fn new() -> Self {
        Self {
            counters: Counters::default(),
            run_start: Mutex::new(Instant::now()),
            last_delivery: Mutex::new(None),
        }
    }

    /// A frame was handed to the consumer.
    pub fn record_delivered(&self) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        *self.last_delivery.lock() = Some(Instant::now());
    }

    /// An encoded frame of `bytes` was queued upstream.
    pub fn record_sent(&self, bytes: usize) {
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        self.counters
            .sent_bytes
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_drop(&self, cause: FrameDrop) {
        self.counters.slot(cause).fetch_add(1, Ordering::Relaxed);
    }

    /// Zero every counter. Called when a capture run starts.
    pub fn reset(&self) {
        let c = &self.counters;
        for counter in [
            &c.delivered,
            &c.sent,
            &c.sent_bytes,
            &c.in_flight,
            &c.queue_full,
            &c.inactive,
            &c.throttled,
            &c.send_failed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.run_start.lock() = Instant::now();
        *self.last_delivery.lock() = None;
    }

    pub fn last_frame_age(&self) -> Option<Duration> {
        self.last_delivery.lock().map(|t| t.elapsed())
    }

    pub fn report(&self) -> FrameReport {
        let c = &self.counters;
        let delivered = c.delivered.load(Ordering::Relaxed);
        let dropped = DropCounts {
            in_flight: c.in_flight.load(Ordering::Relaxed),
            queue_full: c.queue_full.load(Ordering::Relaxed),
            inactive: c.inactive.load(Ordering::Relaxed),
            throttled: c.throttled.load(Ordering::Relaxed),
            send_failed: c.send_failed.load(Ordering::Relaxed),
        };
        let produced = delivered + dropped.at_capture();
        let capture_drop_rate = if produced == 0 {
            0.0
        } else {
            dropped.at_capture() as f64 / produced as f64 * 100.0
        };

        let elapsed = self.run_start.lock().elapsed().as_secs_f64();
        let per_second = |n: u64| if elapsed < 0.001 { 0.0 } else { n as f64 / elapsed };

        FrameReport {
            fps: per_second(delivered),
            delivered,
            sent: c.sent.load(Ordering::Relaxed),
            dropped,
            capture_drop_rate,
            upload_bps: per_second(c.sent_bytes.load(Ordering::Relaxed)) as u64,
            last_frame_age_ms: self.last_frame_age().map(|d| d.as_millis() as u64),
        }
    }
}

impl Default for FrameStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_are_counted_by_cause() {
        let stats = FrameStats::new();
        stats.record_drop(FrameDrop::InFlight);
        stats.record_drop(FrameDrop::InFlight);
        stats.record_drop(FrameDrop::Throttled);
        stats.record_drop(FrameDrop::SendFailed);

        let dropped = stats.report().dropped;
        assert_eq!(
            dropped,
            DropCounts {
                in_flight: 2,
                throttled: 1,
                send_failed: 1,
                ..DropCounts::default()
            }
        );
        assert_eq!(dropped.at_capture(), 2);
        assert_eq!(dropped.upstream(), 2);
    }

    #[test]
    fn upstream_drops_do_not_count_against_capture() {
        let stats = FrameStats::new();
        for _ in 0..3 {
            stats.record_delivered();
        }
        stats.record_drop(FrameDrop::QueueFull);
        stats.record_drop(FrameDrop::Inactive);
        stats.record_drop(FrameDrop::Inactive);

        // 1 of 4 camera frames never reached the consumer.
        let rate = stats.report().capture_drop_rate;
        assert!((rate - 25.0).abs() < 1e-9, "got {rate}");
    }

    #[test]
    fn sent_frames_feed_the_upload_rate() {
        let stats = FrameStats::new();
        stats.record_delivered();
        stats.record_sent(20_000);
        std::thread::sleep(Duration::from_millis(20));

        let report = stats.report();
        assert_eq!(report.sent, 1);
        assert!(report.upload_bps > 0);
        assert!(report.fps > 0.0);
    }

    #[test]
    fn reset_starts_a_fresh_run() {
        let stats = FrameStats::new();
        stats.record_delivered();
        stats.record_sent(10);
        stats.record_drop(FrameDrop::InFlight);
        stats.reset();

        let report = stats.report();
        assert_eq!(report.delivered, 0);
        assert_eq!(report.sent, 0);
        assert_eq!(report.dropped, DropCounts::default());
        assert!(report.last_frame_age_ms.is_none());
    }

    #[test]
    fn report_serialises_to_camelcase() {
        let stats = FrameStats::new();
        stats.record_delivered();
        let json = serde_json::to_value(stats.report()).unwrap();
        assert_eq!(json["delivered"], 1);
        assert_eq!(json["dropped"]["inFlight"], 0);
        assert!(json["captureDropRate"].is_number());
        assert!(json["lastFrameAgeMs"].is_number());
    }
}
