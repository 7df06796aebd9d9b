use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::audio::device::{AudioOutput, PcmWriter, DOWNLINK_FORMAT};

/// Largest slice handed to the output device in one write.
pub const WRITE_CHUNK_BYTES: usize = 4096;

struct Queue {
    chunks: VecDeque<Bytes>,
    /// Bumped by `stop()`; a chunk popped under an older epoch is abandoned.
    epoch: u64,
}

struct Shared {
    queue: Mutex<Queue>,
    writer: Mutex<Option<Arc<dyn PcmWriter>>>,
    /// Set while a playback loop owns the queue.
    playing: AtomicBool,
    disposed: AtomicBool,
    chunks_played: AtomicU64,
}

/// Plays audio received from the realtime session.
///
/// Chunks are queued and written to the output device by a playback loop
/// that runs while the queue is non-empty. When the queue drains the loop
/// lets the device finish, pauses it and exits; the next `enqueue` starts a
/// new loop.
pub struct AudioDownlink {
    shared: Arc<Shared>,
}

impl AudioDownlink {
    /// Opens the output device up front. On failure the downlink stays
    /// usable but silently discards audio.
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        let writer = match output.open(DOWNLINK_FORMAT) {
            Ok(writer) => Some(Arc::from(writer)),
            Err(e) => {
                error!("failed to open audio output: {e}");
                None
            }
        };
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(Queue {
                    chunks: VecDeque::new(),
                    epoch: 0,
                }),
                writer: Mutex::new(writer),
                playing: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                chunks_played: AtomicU64::new(0),
            }),
        }
    }

    /// Queue 24 kHz mono s16le PCM for playback.
    pub fn enqueue(&self, pcm: Bytes) {
        if self.shared.disposed.load(Ordering::Acquire) {
            debug!("audio downlink disposed, dropping {} bytes", pcm.len());
            return;
        }
        if pcm.is_empty() {
            warn!("received empty audio data");
            return;
        }
        if self.shared.writer.lock().is_none() {
            debug!("no audio output, dropping {} bytes", pcm.len());
            return;
        }

        self.shared.queue.lock().chunks.push_back(pcm);
        if !self.shared.playing.swap(true, Ordering::AcqRel) {
            spawn_playback(Arc::clone(&self.shared));
        }
    }

    /// Drop everything queued and silence the device now.
    pub fn stop(&self) {
        {
            let mut queue = self.shared.queue.lock();
            queue.chunks.clear();
            queue.epoch += 1;
        }
        let writer = self.shared.writer.lock().clone();
        if let Some(writer) = writer {
            writer.pause();
            writer.flush();
        }
    }

    /// Stop and release the output device. Later enqueues are ignored.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop();
        // A running loop holds its own reference; the device goes when it exits.
        self.shared.writer.lock().take();
        debug!("audio downlink disposed");
    }

    pub fn is_playing(&self) -> bool {
        self.shared.playing.load(Ordering::Acquire)
    }

    pub fn queued_chunks(&self) -> usize {
        self.shared.queue.lock().chunks.len()
    }

    pub fn chunks_played(&self) -> u64 {
        self.shared.chunks_played.load(Ordering::Acquire)
    }
}

impl Drop for AudioDownlink {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn spawn_playback(shared: Arc<Shared>) {
    let job = move || playback_loop(shared);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(job);
        }
        Err(_) => {
            if let Err(e) = std::thread::Builder::new()
                .name("audio-playback".into())
                .spawn(job)
            {
                error!("failed to start audio playback: {e}");
            }
        }
    }
}

fn playback_loop(shared: Arc<Shared>) {
    let Some(writer) = shared.writer.lock().clone() else {
        shared.playing.store(false, Ordering::Release);
        return;
    };
    debug!("audio playback started");

    let mut played_epoch = None;
    loop {
        loop {
            if shared.disposed.load(Ordering::Acquire) {
                break;
            }
            let (chunk, epoch) = {
                let mut queue = shared.queue.lock();
                (queue.chunks.pop_front(), queue.epoch)
            };
            let Some(chunk) = chunk else { break };

            // stop() pauses the device; resume before playing newer audio.
            if played_epoch != Some(epoch) {
                if let Err(e) = writer.play() {
                    error!("failed to start audio output: {e}");
                    shared.queue.lock().chunks.clear();
                    break;
                }
                played_epoch = Some(epoch);
            }

            if write_chunk(&shared, writer.as_ref(), &chunk, epoch) {
                shared.chunks_played.fetch_add(1, Ordering::AcqRel);
            }
        }

        writer.finish();
        // The device is paused now; a restart below has to resume it.
        played_epoch = None;
        shared.playing.store(false, Ordering::Release);

        // An enqueue between the last pop and clearing the flag saw the loop
        // still running and did not start another one; pick its audio up here.
        let pending = !shared.queue.lock().chunks.is_empty();
        if !pending
            || shared.disposed.load(Ordering::Acquire)
            || shared.playing.swap(true, Ordering::AcqRel)
        {
            break;
        }
    }
    debug!("audio playback finished");
}

/// Write one chunk in bounded slices. Returns `false` if it was abandoned.
fn write_chunk(shared: &Shared, writer: &dyn PcmWriter, chunk: &[u8], epoch: u64) -> bool {
    let mut offset = 0;
    while offset < chunk.len() {
        if shared.queue.lock().epoch != epoch || shared.disposed.load(Ordering::Acquire) {
            return false;
        }
        let end = (offset + WRITE_CHUNK_BYTES).min(chunk.len());
        match writer.write(&chunk[offset..end]) {
            Ok(0) => std::thread::sleep(Duration::from_millis(1)),
            Ok(n) => offset += n,
            Err(e) => {
                error!("audio write failed: {e}");
                return false;
            }
        }
    }
    true
}

impl std::fmt::Debug for AudioDownlink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDownlink")
            .field("playing", &self.is_playing())
            .field("queued", &self.queued_chunks())
            .finish()
    }
}
