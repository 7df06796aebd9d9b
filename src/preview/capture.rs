use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender, SyncSender, TrySendError};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::camera::backend::{
    CameraBackend, CameraDeviceHandle, FrameSink, OutputTarget, StreamSession,
};
use crate::camera::endpoint::CameraEndpoint;
use crate::camera::error::{CameraError, Result, SessionFault};
use crate::camera::oneshot::OneShot;
use crate::camera::types::{CameraEye, DeviceEvent, PixelFormat, RawFrame};
use crate::diagnostics::stats::{FrameDrop, FrameReport, FrameStats};
use crate::events::{SubscriptionId, Subscribers};
use crate::preview::consumer::{FrameCompletion, FrameConsumer, InFlightGuard};
use crate::preview::surface::PreviewSurface;

/// Format requested from the camera for the in-memory frame reader.
const READER_FORMAT: PixelFormat = PixelFormat::Yuv420;

/// Frames waiting for the dispatch thread. The in-flight guard is taken
/// before a frame is queued, so at most one is ever waiting.
const DISPATCH_QUEUE_DEPTH: usize = 2;

/// Lifecycle of a capture session. `Idle` is both initial and terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Initializing,
    Opening,
    Configuring,
    Streaming,
    Stopping,
}

/// Why a running capture stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    Requested,
    Fault(SessionFault),
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("stop requested"),
            Self::Fault(fault) => write!(f, "{fault}"),
        }
    }
}

/// Timing and selection knobs for a capture session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Which passthrough camera to stream from.
    pub eye: CameraEye,
    /// Maximum wait for preview targets to become renderable.
    pub target_timeout: Duration,
    pub target_poll_interval: Duration,
    /// Maximum wait for the backend to report an open or configure outcome.
    pub command_timeout: Duration,
    /// Delay before the frame reader stops accepting frames after `stop()`.
    pub reader_grace: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            eye: CameraEye::Left,
            target_timeout: Duration::from_secs(10),
            target_poll_interval: Duration::from_millis(10),
            command_timeout: Duration::from_secs(10),
            reader_grace: Duration::from_millis(100),
        }
    }
}

type Command = Box<dyn FnOnce() + Send>;

/// Named thread that runs camera commands one at a time, in order.
struct CommandWorker {
    tx: Sender<Command>,
    _thread: JoinHandle<()>,
}

impl CommandWorker {
    fn spawn() -> Result<Self> {
        let (tx, rx) = mpsc::channel::<Command>();
        let thread = std::thread::Builder::new()
            .name("camera-commands".to_string())
            .spawn(move || {
                debug!("camera command worker started");
                while let Ok(command) = rx.recv() {
                    command();
                }
                debug!("camera command worker exiting");
            })
            .map_err(|e| CameraError::Thread {
                name: "camera-commands",
                reason: e.to_string(),
            })?;
        Ok(Self {
            tx,
            _thread: thread,
        })
    }
}

type Dispatch = (RawFrame, FrameCompletion, Arc<dyn FrameConsumer>);

/// Dedicated thread that hands frames to the consumer.
struct FrameDispatcher {
    tx: SyncSender<Dispatch>,
    _thread: JoinHandle<()>,
}

impl FrameDispatcher {
    fn spawn() -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Dispatch>(DISPATCH_QUEUE_DEPTH);
        let thread = std::thread::Builder::new()
            .name("frame-dispatch".to_string())
            .spawn(move || {
                while let Ok((frame, completion, consumer)) = rx.recv() {
                    consumer.on_frame(Arc::new(frame), completion);
                }
                debug!("frame dispatch thread exiting");
            })
            .map_err(|e| CameraError::Thread {
                name: "frame-dispatch",
                reason: e.to_string(),
            })?;
        Ok(Self {
            tx,
            _thread: thread,
        })
    }
}

/// Gate in front of the dispatch thread for one capture run.
struct FrameReader {
    open: Arc<AtomicBool>,
}

impl FrameReader {
    fn new(
        consumer: Arc<dyn FrameConsumer>,
        tx: SyncSender<Dispatch>,
        guard: InFlightGuard,
        stats: Arc<FrameStats>,
    ) -> (Self, FrameSink) {
        let open = Arc::new(AtomicBool::new(true));
        let gate = Arc::clone(&open);
        let sink: FrameSink = Arc::new(move |frame: RawFrame| {
            if !gate.load(Ordering::Acquire) {
                return;
            }
            let Some(completion) = guard.try_acquire() else {
                stats.record_drop(FrameDrop::InFlight);
                return;
            };
            match tx.try_send((frame, completion, Arc::clone(&consumer))) {
                Ok(()) => stats.record_delivered(),
                Err(TrySendError::Full(_)) => {
                    stats.record_drop(FrameDrop::QueueFull);
                    warn!("frame dispatch queue full, dropping frame");
                }
                Err(TrySendError::Disconnected(_)) => debug!("frame dispatch closed"),
            }
        });
        (Self { open }, sink)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

struct Inner {
    backend: Arc<dyn CameraBackend>,
    config: CaptureConfig,
    state: Mutex<CaptureState>,
    endpoint: Mutex<Option<CameraEndpoint>>,
    running: AtomicBool,
    disposed: AtomicBool,
    worker: Mutex<Option<CommandWorker>>,
    dispatcher: Mutex<Option<FrameDispatcher>>,
    device: Mutex<Option<Box<dyn CameraDeviceHandle>>>,
    stream: Mutex<Option<Box<dyn StreamSession>>>,
    reader: Mutex<Option<FrameReader>>,
    guard: InFlightGuard,
    stats: Arc<FrameStats>,
    endpoint_ready: Subscribers<CameraEndpoint>,
    stopped: Subscribers<StopCause>,
}

impl Inner {
    fn set_state(&self, state: CaptureState) {
        *self.state.lock() = state;
    }

    /// Queue a command on the camera worker. Hands the command back once
    /// the worker is gone.
    fn submit(
        &self,
        command: impl FnOnce() + Send + 'static,
    ) -> std::result::Result<(), Command> {
        let command: Command = Box::new(command);
        match self.worker.lock().as_ref() {
            Some(worker) => worker.tx.send(command).map_err(|e| e.0),
            None => Err(command),
        }
    }

    fn stop(&self, cause: StopCause) {
        let was_running = self.running.swap(false, Ordering::AcqRel);

        let stream = self.stream.lock().take();
        let device = self.device.lock().take();
        let reader = self.reader.lock().take();

        if !was_running && stream.is_none() && device.is_none() && reader.is_none() {
            self.set_state(CaptureState::Idle);
            return;
        }

        self.set_state(CaptureState::Stopping);
        info!("stopping camera capture ({cause})");

        let grace = self.config.reader_grace;
        let release = move || {
            if let Some(mut stream) = stream {
                stream.stop_repeating();
                stream.close();
            }
            if let Some(mut device) = device {
                device.close();
            }
            if let Some(reader) = reader {
                // Let a trailing frame callback land before the reader goes away.
                std::thread::sleep(grace);
                reader.close();
            }
        };

        if let Err(release) = self.submit(release) {
            warn!("camera worker unavailable, releasing on caller thread");
            release();
        }

        self.set_state(CaptureState::Idle);
        if was_running {
            self.stopped.emit(&cause);
        }
    }

    fn handle_device_event(&self, event: DeviceEvent) {
        let fault = match event {
            DeviceEvent::Disconnected => SessionFault::Disconnected,
            DeviceEvent::Error(code) => SessionFault::from_code(code),
        };
        error!("camera device reported {fault}");
        self.stop(StopCause::Fault(fault));
    }
}

/// Owns the selected camera and streams its frames to a consumer.
///
/// All device commands run on a single `camera-commands` thread; frames are
/// handed to the consumer on a `frame-dispatch` thread. A frame is only
/// dispatched when no earlier frame is still in flight, otherwise it is
/// dropped and counted.
pub struct CaptureSession {
    inner: Arc<Inner>,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn CameraBackend>, config: CaptureConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                config,
                state: Mutex::new(CaptureState::Idle),
                endpoint: Mutex::new(None),
                running: AtomicBool::new(false),
                disposed: AtomicBool::new(false),
                worker: Mutex::new(None),
                dispatcher: Mutex::new(None),
                device: Mutex::new(None),
                stream: Mutex::new(None),
                reader: Mutex::new(None),
                guard: InFlightGuard::new(),
                stats: Arc::new(FrameStats::new()),
                endpoint_ready: Subscribers::new(),
                stopped: Subscribers::new(),
            }),
        }
    }

    /// Pick the camera for the configured eye and compute its endpoint.
    ///
    /// Also starts the command and dispatch threads. Calling it again after
    /// success returns the same endpoint.
    pub fn initialize(&self) -> Result<CameraEndpoint> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(CameraError::Disposed);
        }
        if let Some(endpoint) = self.inner.endpoint.lock().clone() {
            return Ok(endpoint);
        }

        self.inner.set_state(CaptureState::Initializing);
        let result = self.select_endpoint().and_then(|endpoint| {
            let mut worker = self.inner.worker.lock();
            if worker.is_none() {
                *worker = Some(CommandWorker::spawn()?);
            }
            let mut dispatcher = self.inner.dispatcher.lock();
            if dispatcher.is_none() {
                *dispatcher = Some(FrameDispatcher::spawn()?);
            }
            Ok(endpoint)
        });
        self.inner.set_state(CaptureState::Idle);

        let endpoint = result?;
        info!(
            "camera endpoint ready: {} ({} eye, {}, fov {:.1} deg)",
            endpoint.id,
            endpoint.eye,
            endpoint.resolution(),
            endpoint.fov
        );
        *self.inner.endpoint.lock() = Some(endpoint.clone());
        self.inner.endpoint_ready.emit(&endpoint);
        Ok(endpoint)
    }

    fn select_endpoint(&self) -> Result<CameraEndpoint> {
        let devices = self.inner.backend.enumerate_devices()?;
        if devices.is_empty() {
            return Err(CameraError::NoDevices);
        }

        let wanted = self.inner.config.eye;
        // Several ids can map to the same eye; the last one listed wins.
        let device = devices
            .iter()
            .rev()
            .find(|d| CameraEye::from_position(d.characteristics.position) == wanted)
            .ok_or(CameraError::NoMatchingEndpoint(wanted))?;

        CameraEndpoint::from_device(device, wanted)
    }

    /// Start streaming to `targets` and, when present, to `consumer`.
    ///
    /// Waits for every target to become renderable, opens the device,
    /// configures the stream and starts the repeating request. Any failure
    /// after the wait stops the session before the error is returned.
    pub async fn start(
        &self,
        targets: Vec<Arc<dyn PreviewSurface>>,
        consumer: Option<Arc<dyn FrameConsumer>>,
    ) -> Result<()> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(CameraError::Disposed);
        }
        let Some(endpoint) = self.inner.endpoint.lock().clone() else {
            return Err(CameraError::NotInitialized);
        };
        if targets.is_empty() && consumer.is_none() {
            warn!("capture start ignored: no preview targets and no frame consumer");
            return Ok(());
        }
        if self.inner.running.swap(true, Ordering::AcqRel) {
            warn!("capture already running");
            return Ok(());
        }
        if !self.inner.backend.has_permission() {
            self.inner.running.store(false, Ordering::Release);
            return Err(CameraError::PermissionDenied);
        }

        if let Err(e) = self.wait_for_targets(&targets).await {
            self.inner.running.store(false, Ordering::Release);
            return Err(e);
        }
        if !self.is_running() {
            debug!("capture stopped while waiting for preview targets");
            return Ok(());
        }

        match self.open_and_stream(&endpoint, &targets, consumer).await {
            Ok(()) if self.is_running() => {
                self.inner.set_state(CaptureState::Streaming);
                info!("camera {} streaming", endpoint.id);
                Ok(())
            }
            Ok(()) => {
                // stop() raced with start; make sure nothing stays open.
                self.inner.stop(StopCause::Requested);
                Ok(())
            }
            Err(e) => {
                error!("failed to start capture: {e}");
                self.inner.stop(StopCause::Requested);
                Err(e)
            }
        }
    }

    async fn wait_for_targets(&self, targets: &[Arc<dyn PreviewSurface>]) -> Result<()> {
        let timeout = self.inner.config.target_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if targets.iter().all(|t| t.is_available()) || !self.is_running() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("preview targets not ready after {timeout:?}");
                return Err(CameraError::Timeout(timeout));
            }
            tokio::time::sleep(self.inner.config.target_poll_interval).await;
        }
    }

    async fn open_and_stream(
        &self,
        endpoint: &CameraEndpoint,
        targets: &[Arc<dyn PreviewSurface>],
        consumer: Option<Arc<dyn FrameConsumer>>,
    ) -> Result<()> {
        self.inner.set_state(CaptureState::Opening);
        let (outcome, rx) = OneShot::channel("camera open");
        let backend = Arc::clone(&self.inner.backend);
        let id = endpoint.id.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let on_event = Arc::new(move |event: DeviceEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.handle_device_event(event);
            }
        });
        if self
            .inner
            .submit(move || backend.open(&id, outcome, on_event))
            .is_err()
        {
            return Err(CameraError::Disposed);
        }
        let device = self.await_outcome(rx, "open").await?;
        *self.inner.device.lock() = Some(device);
        if !self.is_running() {
            return Ok(());
        }

        self.inner.set_state(CaptureState::Configuring);
        let mut outputs = Vec::with_capacity(targets.len() + 1);
        for target in targets {
            let handle = target
                .target()
                .ok_or_else(|| CameraError::Configure("preview target went away".to_string()))?;
            outputs.push(OutputTarget::Surface(handle));
        }
        if let Some(consumer) = consumer {
            let tx = self
                .inner
                .dispatcher
                .lock()
                .as_ref()
                .map(|d| d.tx.clone())
                .ok_or(CameraError::Disposed)?;
            self.inner.stats.reset();
            let (reader, sink) = FrameReader::new(
                consumer,
                tx,
                self.inner.guard.clone(),
                Arc::clone(&self.inner.stats),
            );
            *self.inner.reader.lock() = Some(reader);
            outputs.push(OutputTarget::FrameReader {
                size: endpoint.resolution(),
                format: READER_FORMAT,
                sink,
            });
        }

        let (outcome, rx) = OneShot::channel("session configure");
        let inner = Arc::clone(&self.inner);
        let queued = self.inner.submit(move || match inner.device.lock().as_mut() {
            Some(device) => device.create_session(outputs, outcome),
            None => {
                outcome.resolve(Err(CameraError::Session(SessionFault::Disconnected)));
            }
        });
        if queued.is_err() {
            return Err(CameraError::Disposed);
        }
        let stream = self.await_outcome(rx, "configure").await?;
        *self.inner.stream.lock() = Some(stream);
        if !self.is_running() {
            return Ok(());
        }

        let (outcome, rx) = OneShot::channel("repeating request");
        let inner = Arc::clone(&self.inner);
        let queued = self.inner.submit(move || {
            let result = match inner.stream.lock().as_mut() {
                Some(stream) => stream.set_repeating_request(),
                None => Err(CameraError::Session(SessionFault::ConfigureFailed)),
            };
            outcome.resolve(result);
        });
        if queued.is_err() {
            return Err(CameraError::Disposed);
        }
        self.await_outcome(rx, "repeating request").await
    }

    async fn await_outcome<T>(
        &self,
        rx: oneshot::Receiver<Result<T>>,
        what: &str,
    ) -> Result<T> {
        let timeout = self.inner.config.command_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CameraError::Request(format!("{what} outcome was dropped"))),
            Err(_) => {
                warn!("camera {what} did not complete within {timeout:?}");
                Err(CameraError::Timeout(timeout))
            }
        }
    }

    /// Halt streaming and release the session, device and frame reader.
    ///
    /// Never waits on hardware: releases are queued on the command worker.
    /// Safe to call from any state.
    pub fn stop(&self) {
        self.inner.stop(StopCause::Requested);
    }

    /// Stop and shut down the worker threads. Later calls are no-ops.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.stop(StopCause::Requested);
        // Dropping the senders lets both threads drain and exit on their own.
        self.inner.worker.lock().take();
        self.inner.dispatcher.lock().take();
        self.inner.set_state(CaptureState::Idle);
        debug!("capture session disposed");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.endpoint.lock().is_some()
    }

    pub fn state(&self) -> CaptureState {
        *self.inner.state.lock()
    }

    pub fn endpoint(&self) -> Option<CameraEndpoint> {
        self.inner.endpoint.lock().clone()
    }

    /// Frame accounting for the current run.
    pub fn diagnostics(&self) -> FrameReport {
        self.inner.stats.report()
    }

    /// Counters for the current run, for consumers that report their own
    /// drops.
    pub fn frame_stats(&self) -> Arc<FrameStats> {
        Arc::clone(&self.inner.stats)
    }

    /// Called once the endpoint is known, e.g. to place the preview panel.
    pub fn on_endpoint_ready(
        &self,
        callback: impl Fn(&CameraEndpoint) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.endpoint_ready.subscribe(callback)
    }

    /// Called whenever a running capture stops.
    pub fn on_stopped(
        &self,
        callback: impl Fn(&StopCause) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.inner.stopped.subscribe(callback)
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        self.dispose();
    }
}
