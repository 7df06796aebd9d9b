//! Audio devices through cpal.
//!
//! cpal streams are `!Send`: capture streams live on the uplink thread that
//! opens them, playback streams on a dedicated `audio-output` thread that
//! takes play/pause commands from the writer.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::audio::device::{AudioInput, AudioOutput, PcmFormat, PcmReader, PcmWriter};
use crate::audio::error::{AudioError, Result};
use crate::audio::pcm;

/// Captured audio older than this is dropped when nobody reads it.
const MAX_PENDING: Duration = Duration::from_secs(1);

/// How much decoded audio the output ring holds before writes block.
const OUTPUT_BUFFER: Duration = Duration::from_millis(250);

/// Check whether an input device is available without opening it.
pub fn input_available() -> bool {
    cpal::default_host()
        .default_input_device()
        .and_then(|d| d.default_input_config().ok())
        .is_some()
}

pub fn output_available() -> bool {
    cpal::default_host()
        .default_output_device()
        .and_then(|d| d.default_output_config().ok())
        .is_some()
}

/// The default microphone.
#[derive(Debug, Default)]
pub struct CpalInput;

impl AudioInput for CpalInput {
    fn has_permission(&self) -> bool {
        // Desktop hosts have no capture permission; a missing device is
        // reported by `open`.
        true
    }

    fn open(&self, format: PcmFormat) -> Result<Box<dyn PcmReader>> {
        let device = cpal::default_host()
            .default_input_device()
            .ok_or_else(|| AudioError::Device("no audio input device available".into()))?;
        let supported = device
            .default_input_config()
            .map_err(|e| AudioError::Device(e.to_string()))?;

        info!(
            "audio input: {:?} ({} Hz, {} ch, {:?})",
            device.name().unwrap_or_default(),
            supported.sample_rate().0,
            supported.channels(),
            supported.sample_format(),
        );

        let (tx, rx) = mpsc::channel::<Vec<f32>>();
        let failure = Arc::new(Mutex::new(None));
        let config = supported.config();
        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_input::<f32>(&device, &config, tx, &failure),
            cpal::SampleFormat::I16 => build_input::<i16>(&device, &config, tx, &failure),
            cpal::SampleFormat::I32 => build_input::<i32>(&device, &config, tx, &failure),
            other => {
                return Err(AudioError::Device(format!(
                    "unsupported input sample format {other:?}"
                )))
            }
        }?;
        stream
            .play()
            .map_err(|e| AudioError::Stream(e.to_string()))?;

        Ok(Box::new(CpalReader {
            _stream: stream,
            samples: rx,
            failure,
            source_rate: config.sample_rate.0,
            channels: config.channels,
            target_rate: format.sample_rate,
            max_pending: format.bytes_per_second() * MAX_PENDING.as_secs() as usize,
            pending: VecDeque::new(),
        }))
    }
}

fn build_input<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    tx: mpsc::Sender<Vec<f32>>,
    failure: &Arc<Mutex<Option<String>>>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let failure = Arc::clone(failure);
    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| f32::from_sample(s)).collect();
                let _ = tx.send(samples);
            },
            move |err| {
                error!("audio input stream error: {err}");
                *failure.lock() = Some(err.to_string());
            },
            None,
        )
        .map_err(|e| AudioError::Device(e.to_string()))
}

struct CpalReader {
    _stream: cpal::Stream,
    samples: mpsc::Receiver<Vec<f32>>,
    failure: Arc<Mutex<Option<String>>>,
    source_rate: u32,
    channels: u16,
    target_rate: u32,
    max_pending: usize,
    pending: VecDeque<u8>,
}

impl PcmReader for CpalReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if let Some(reason) = self.failure.lock().take() {
            return Err(AudioError::Stream(reason));
        }

        loop {
            match self.samples.try_recv() {
                Ok(raw) => {
                    let mono = pcm::downmix_to_mono(&raw, self.channels);
                    let resampled = pcm::resample(&mono, self.source_rate, self.target_rate);
                    self.pending.extend(pcm::f32_to_s16le(&resampled));
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if self.pending.is_empty() {
                        return Err(AudioError::Stream("audio input stream ended".into()));
                    }
                    break;
                }
            }
        }

        if self.pending.len() > self.max_pending {
            // Keep whole samples when trimming.
            let excess = (self.pending.len() - self.max_pending) & !1;
            self.pending.drain(..excess);
        }

        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }
}

/// The default speaker.
#[derive(Debug, Default)]
pub struct CpalOutput;

enum Control {
    Play,
    Pause,
}

struct OutputRing {
    samples: Mutex<VecDeque<f32>>,
    drained: Condvar,
    active: AtomicBool,
    flushes: AtomicU64,
    capacity: usize,
}

impl AudioOutput for CpalOutput {
    fn open(&self, format: PcmFormat) -> Result<Box<dyn PcmWriter>> {
        let (ready_tx, ready_rx) = mpsc::channel();
        let (control_tx, control_rx) = mpsc::channel();

        std::thread::Builder::new()
            .name("audio-output".into())
            .spawn(move || run_output(control_rx, ready_tx))
            .map_err(|e| AudioError::Device(e.to_string()))?;

        let (ring, device_rate) = ready_rx
            .recv()
            .map_err(|_| AudioError::Device("audio output thread exited".into()))??;

        Ok(Box::new(CpalWriter {
            ring,
            control: control_tx,
            source_rate: format.sample_rate,
            device_rate,
        }))
    }
}

type OutputReady = Result<(Arc<OutputRing>, u32)>;

fn run_output(control: mpsc::Receiver<Control>, ready: mpsc::Sender<OutputReady>) {
    let stream = match open_output() {
        Ok((stream, ring, rate)) => {
            if ready.send(Ok((ring, rate))).is_err() {
                return;
            }
            stream
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    // Runs until the writer is dropped.
    while let Ok(command) = control.recv() {
        let result = match command {
            Control::Play => stream.play().map_err(|e| e.to_string()),
            Control::Pause => stream.pause().map_err(|e| e.to_string()),
        };
        if let Err(e) = result {
            error!("audio output control failed: {e}");
        }
    }
    debug!("audio output released");
}

fn open_output() -> Result<(cpal::Stream, Arc<OutputRing>, u32)> {
    let device = cpal::default_host()
        .default_output_device()
        .ok_or_else(|| AudioError::Device("no audio output device available".into()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::Device(e.to_string()))?;
    let config = supported.config();

    info!(
        "audio output: {:?} ({} Hz, {} ch, {:?})",
        device.name().unwrap_or_default(),
        config.sample_rate.0,
        config.channels,
        supported.sample_format(),
    );

    let capacity = (config.sample_rate.0 as f64 * OUTPUT_BUFFER.as_secs_f64()) as usize;
    let ring = Arc::new(OutputRing {
        samples: Mutex::new(VecDeque::with_capacity(capacity)),
        drained: Condvar::new(),
        active: AtomicBool::new(false),
        flushes: AtomicU64::new(0),
        capacity,
    });

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => build_output::<f32>(&device, &config, &ring),
        cpal::SampleFormat::I16 => build_output::<i16>(&device, &config, &ring),
        cpal::SampleFormat::U16 => build_output::<u16>(&device, &config, &ring),
        other => {
            return Err(AudioError::Device(format!(
                "unsupported output sample format {other:?}"
            )))
        }
    }?;
    // Start paused; the playback loop resumes it.
    stream
        .pause()
        .map_err(|e| AudioError::Stream(e.to_string()))?;

    Ok((stream, ring, config.sample_rate.0))
}

fn build_output<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    ring: &Arc<OutputRing>,
) -> Result<cpal::Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let ring = Arc::clone(ring);
    let channels = config.channels.max(1) as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut samples = ring.samples.lock();
                for frame in data.chunks_mut(channels) {
                    let value = T::from_sample(samples.pop_front().unwrap_or(0.0));
                    for slot in frame {
                        *slot = value;
                    }
                }
                drop(samples);
                ring.drained.notify_all();
            },
            |err| error!("audio output stream error: {err}"),
            None,
        )
        .map_err(|e| AudioError::Device(e.to_string()))
}

struct CpalWriter {
    ring: Arc<OutputRing>,
    control: mpsc::Sender<Control>,
    source_rate: u32,
    device_rate: u32,
}

impl CpalWriter {
    fn send(&self, command: Control) -> Result<()> {
        self.control
            .send(command)
            .map_err(|_| AudioError::Stream("audio output thread exited".into()))
    }
}

impl PcmWriter for CpalWriter {
    fn play(&self) -> Result<()> {
        self.ring.active.store(true, Ordering::Release);
        self.send(Control::Play)
    }

    fn write(&self, pcm_bytes: &[u8]) -> Result<usize> {
        let decoded = pcm::s16le_to_f32(pcm_bytes);
        let samples = pcm::resample(&decoded, self.source_rate, self.device_rate);
        let flushes = self.ring.flushes.load(Ordering::Acquire);

        let mut ring = self.ring.samples.lock();
        while !ring.is_empty() && ring.len() + samples.len() > self.ring.capacity {
            // Paused or flushed while waiting: the audio is no longer wanted.
            if !self.ring.active.load(Ordering::Acquire)
                || self.ring.flushes.load(Ordering::Acquire) != flushes
            {
                return Ok(pcm_bytes.len());
            }
            self.ring
                .drained
                .wait_for(&mut ring, Duration::from_millis(20));
        }
        ring.extend(samples);
        Ok(pcm_bytes.len())
    }

    fn finish(&self) {
        let deadline = Instant::now() + OUTPUT_BUFFER + Duration::from_millis(200);
        let mut ring = self.ring.samples.lock();
        while !ring.is_empty()
            && self.ring.active.load(Ordering::Acquire)
            && Instant::now() < deadline
        {
            self.ring
                .drained
                .wait_for(&mut ring, Duration::from_millis(20));
        }
        drop(ring);
        self.pause();
    }

    fn pause(&self) {
        self.ring.active.store(false, Ordering::Release);
        let _ = self.send(Control::Pause);
    }

    fn flush(&self) {
        self.ring.flushes.fetch_add(1, Ordering::AcqRel);
        self.ring.samples.lock().clear();
        self.ring.drained.notify_all();
    }
}
