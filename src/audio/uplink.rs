use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::audio::device::{AudioInput, UPLINK_FORMAT};
use crate::audio::error::{AudioError, Result};

/// Bytes read per loop iteration: 100 ms of 16 kHz mono s16le.
pub const CHUNK_BYTES: usize = 3200;

/// Pause between reads.
pub const CHUNK_DELAY: Duration = Duration::from_millis(100);

/// Where captured microphone audio goes.
pub trait AudioChunkSink: Send + Sync {
    fn is_active(&self) -> bool;

    /// Forward one chunk of 16 kHz mono s16le PCM. Returns `false` when the
    /// chunk was dropped.
    fn send_audio_chunk(&self, pcm: &[u8]) -> bool;
}

/// Streams the microphone to an [`AudioChunkSink`].
///
/// Capture runs on its own `audio-uplink` thread, which opens the input
/// device and releases it when the loop exits.
pub struct AudioUplink {
    target: Weak<dyn AudioChunkSink>,
    input: Arc<dyn AudioInput>,
    chunk_bytes: usize,
    chunk_delay: Duration,
    /// Run flag of the current capture loop, if any.
    run: Mutex<Option<Arc<AtomicBool>>>,
}

impl AudioUplink {
    pub fn new(target: Weak<dyn AudioChunkSink>, input: Arc<dyn AudioInput>) -> Self {
        Self {
            target,
            input,
            chunk_bytes: CHUNK_BYTES,
            chunk_delay: CHUNK_DELAY,
            run: Mutex::new(None),
        }
    }

    /// Start capturing. Logs and returns `false` when it could not start.
    pub async fn start(&self) -> bool {
        match self.try_start().await {
            Ok(()) => true,
            Err(e) => {
                error!("audio uplink not started: {e}");
                false
            }
        }
    }

    /// Start capturing, or succeed immediately if already running.
    ///
    /// Fails when the target session is not active, the microphone
    /// permission is missing, or the input device cannot be opened.
    pub async fn try_start(&self) -> Result<()> {
        let active = self.target.upgrade().is_some_and(|t| t.is_active());
        if !active {
            return Err(AudioError::SessionInactive);
        }
        if !self.input.has_permission() {
            return Err(AudioError::PermissionDenied);
        }

        let running = {
            let mut slot = self.run.lock();
            if slot.as_ref().is_some_and(|r| r.load(Ordering::Acquire)) {
                warn!("audio uplink already running");
                return Ok(());
            }
            let running = Arc::new(AtomicBool::new(true));
            *slot = Some(Arc::clone(&running));
            running
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        let job = CaptureJob {
            input: Arc::clone(&self.input),
            target: self.target.clone(),
            running: Arc::clone(&running),
            chunk_bytes: self.chunk_bytes,
            chunk_delay: self.chunk_delay,
        };
        let spawned = std::thread::Builder::new()
            .name("audio-uplink".into())
            .spawn(move || job.run(ready_tx));

        let outcome = match spawned {
            Ok(_) => ready_rx
                .await
                .unwrap_or_else(|_| Err(AudioError::Device("capture thread exited".into()))),
            Err(e) => Err(AudioError::Device(e.to_string())),
        };

        if let Err(e) = outcome {
            running.store(false, Ordering::Release);
            self.clear_slot(&running);
            return Err(e);
        }
        Ok(())
    }

    /// Stop capturing. The device is released when the loop notices.
    pub fn stop(&self) {
        let running = self.run.lock().take();
        if let Some(running) = running {
            if running.swap(false, Ordering::AcqRel) {
                info!("audio uplink stopping");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.run
            .lock()
            .as_ref()
            .is_some_and(|r| r.load(Ordering::Acquire))
    }

    fn clear_slot(&self, running: &Arc<AtomicBool>) {
        let mut slot = self.run.lock();
        if slot.as_ref().is_some_and(|r| Arc::ptr_eq(r, running)) {
            *slot = None;
        }
    }
}

impl Drop for AudioUplink {
    fn drop(&mut self) {
        self.stop();
    }
}

struct CaptureJob {
    input: Arc<dyn AudioInput>,
    target: Weak<dyn AudioChunkSink>,
    running: Arc<AtomicBool>,
    chunk_bytes: usize,
    chunk_delay: Duration,
}

impl CaptureJob {
    fn run(self, ready: oneshot::Sender<Result<()>>) {
        let mut reader = match self.input.open(UPLINK_FORMAT) {
            Ok(reader) => reader,
            Err(e) => {
                self.running.store(false, Ordering::Release);
                let _ = ready.send(Err(e));
                return;
            }
        };
        if ready.send(Ok(())).is_err() {
            self.running.store(false, Ordering::Release);
            return;
        }
        info!("audio uplink started");

        let mut buf = vec![0u8; self.chunk_bytes];
        let mut sent = 0u64;
        while self.running.load(Ordering::Acquire) {
            // A session that closed before the run flag was published never
            // got to stop this loop.
            let Some(target) = self.target.upgrade().filter(|t| t.is_active()) else {
                debug!("audio uplink target no longer active");
                break;
            };
            match reader.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    if target.send_audio_chunk(&buf[..n]) {
                        sent += 1;
                    }
                }
                Err(e) => {
                    error!("audio capture failed: {e}");
                    break;
                }
            }
            std::thread::sleep(self.chunk_delay);
        }

        self.running.store(false, Ordering::Release);
        drop(reader);
        info!("audio uplink finished after {sent} chunks");
    }
}
