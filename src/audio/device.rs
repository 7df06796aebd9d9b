use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::audio::error::Result;

/// Microphone format expected by the realtime endpoint.
pub const UPLINK_FORMAT: PcmFormat = PcmFormat::mono(16_000);

/// Format of the audio the endpoint speaks back.
pub const DOWNLINK_FORMAT: PcmFormat = PcmFormat::mono(24_000);

/// Signed 16-bit little-endian PCM at a given rate and channel count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl PcmFormat {
    pub const fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * 2
    }
}

/// An open capture stream. Lives on the thread that opened it.
pub trait PcmReader {
    /// Copy up to `buf.len()` bytes of captured PCM into `buf`.
    ///
    /// Returns how much was copied, which may be zero when nothing new has
    /// arrived. An error means the stream is gone.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// An open playback stream, shared between the playback loop and callers
/// that need to silence it.
pub trait PcmWriter: Send + Sync {
    fn play(&self) -> Result<()>;

    /// Queue PCM for playback and return how many bytes were accepted. May
    /// block while the device buffer is full.
    fn write(&self, pcm: &[u8]) -> Result<usize>;

    /// Let what was written so far play out, then pause.
    fn finish(&self) {
        self.pause();
    }

    fn pause(&self);

    /// Drop anything queued but not yet played.
    fn flush(&self);
}

pub trait AudioInput: Send + Sync {
    fn has_permission(&self) -> bool {
        true
    }

    fn open(&self, format: PcmFormat) -> Result<Box<dyn PcmReader>>;
}

pub trait AudioOutput: Send + Sync {
    fn open(&self, format: PcmFormat) -> Result<Box<dyn PcmWriter>>;
}

/// Input that produces silence. Used when audio devices are disabled.
#[derive(Debug, Default)]
pub struct SilentInput;

struct SilentReader;

impl PcmReader for SilentReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        buf.fill(0);
        Ok(buf.len())
    }
}

impl AudioInput for SilentInput {
    fn open(&self, _format: PcmFormat) -> Result<Box<dyn PcmReader>> {
        Ok(Box::new(SilentReader))
    }
}

/// Output that discards everything it is given and counts the bytes.
#[derive(Debug, Default, Clone)]
pub struct NullOutput {
    written: Arc<AtomicUsize>,
    playing: Arc<AtomicBool>,
}

impl NullOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }
}

impl AudioOutput for NullOutput {
    fn open(&self, _format: PcmFormat) -> Result<Box<dyn PcmWriter>> {
        Ok(Box::new(self.clone()))
    }
}

impl PcmWriter for NullOutput {
    fn play(&self) -> Result<()> {
        self.playing.store(true, Ordering::Release);
        Ok(())
    }

    fn write(&self, pcm: &[u8]) -> Result<usize> {
        self.written.fetch_add(pcm.len(), Ordering::AcqRel);
        Ok(pcm.len())
    }

    fn pause(&self) {
        self.playing.store(false, Ordering::Release);
    }

    fn flush(&self) {}
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_formats() {
        assert_eq!(UPLINK_FORMAT.bytes_per_second(), 32_000);
        assert_eq!(DOWNLINK_FORMAT.sample_rate, 24_000);
        assert_eq!(DOWNLINK_FORMAT.channels, 1);
    }

    #[test]
    fn null_output_counts_bytes() {
        let output = NullOutput::new();
        let writer = output.open(DOWNLINK_FORMAT).unwrap();
        writer.play().unwrap();
        assert!(output.is_playing());
        assert_eq!(writer.write(&[0; 10]).unwrap(), 10);
        writer.pause();
        assert_eq!(output.bytes_written(), 10);
        assert!(!output.is_playing());
    }

    #[test]
    fn silent_input_fills_zeros() {
        let mut reader = SilentInput.open(UPLINK_FORMAT).unwrap();
        let mut buf = [1u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 8);
        assert_eq!(buf, [0; 8]);
    }
}
