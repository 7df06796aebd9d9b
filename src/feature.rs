use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

use crate::audio::device::{AudioInput, AudioOutput};
use crate::audio::downlink::AudioDownlink;
use crate::camera::backend::CameraBackend;
use crate::camera::endpoint::CameraEndpoint;
use crate::camera::error::{CameraError, Result};
use crate::camera::types::RawFrame;
use crate::diagnostics::stats::{FrameDrop, FrameReport, FrameStats};
use crate::events::{SubscriptionId, Subscribers};
use crate::preview::capture::{CaptureConfig, CaptureSession, StopCause};
use crate::preview::compress::{FrameEncoder, DEFAULT_QUALITY};
use crate::preview::consumer::{FanOutConsumer, FrameCompletion, FrameConsumer};
use crate::preview::surface::PreviewSurface;
use crate::realtime::session::{is_valid_credential, RealtimeConfig, RealtimeSession};
use crate::realtime::transport::Connector;

/// Whether the camera is currently streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CameraStatus {
    #[default]
    Paused,
    Scanning,
}

impl fmt::Display for CameraStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Paused => f.write_str("paused"),
            Self::Scanning => f.write_str("scanning"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    pub capture: CaptureConfig,
    pub realtime: RealtimeConfig,
    /// Stream to the realtime endpoint at all. A missing credential also
    /// disables it.
    pub realtime_enabled: bool,
    pub jpeg_quality: u8,
    /// Keep going after the first `scan()` initializes the camera instead of
    /// waiting for a second call. Used when there is no preview panel to
    /// place first.
    pub scan_after_initialize: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            realtime: RealtimeConfig::default(),
            realtime_enabled: true,
            jpeg_quality: DEFAULT_QUALITY,
            scan_after_initialize: false,
        }
    }
}

/// State reachable from capture callbacks.
struct Shared {
    status: Mutex<CameraStatus>,
    status_changed: Subscribers<CameraStatus>,
    responses: Arc<Subscribers<String>>,
    session: Mutex<Option<Arc<RealtimeSession>>>,
    downlink: Arc<AudioDownlink>,
    frames_seen: AtomicU64,
}

impl Shared {
    fn set_status(&self, status: CameraStatus) {
        {
            let mut current = self.status.lock();
            if *current == status {
                return;
            }
            *current = status;
        }
        info!("camera status: {status}");
        self.status_changed.emit(&status);
    }

    fn close_session(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close();
        }
    }

    fn on_capture_stopped(&self, cause: &StopCause) {
        if let StopCause::Fault(fault) = cause {
            warn!("capture stopped by the device ({fault}), pausing");
            self.set_status(CameraStatus::Paused);
            self.close_session();
            self.downlink.stop();
        }
    }
}

/// Wires the camera, the realtime session and both audio directions
/// together.
///
/// Each `scan()` opens a fresh realtime session and starts capture with the
/// preview surface plus a frame consumer that fans every frame out to local
/// bookkeeping and to the JPEG encoder feeding the session. `pause()` tears
/// the streaming side down again; the camera stays initialized.
pub struct CameraFeature {
    capture: CaptureSession,
    shared: Arc<Shared>,
    preview: Option<Arc<dyn PreviewSurface>>,
    connector: Arc<dyn Connector>,
    audio_input: Arc<dyn AudioInput>,
    encoder: FrameEncoder,
    config: FeatureConfig,
    disposed: AtomicBool,
}

impl CameraFeature {
    pub fn new(
        backend: Arc<dyn CameraBackend>,
        connector: Arc<dyn Connector>,
        audio_input: Arc<dyn AudioInput>,
        audio_output: Arc<dyn AudioOutput>,
        config: FeatureConfig,
    ) -> Self {
        let capture = CaptureSession::new(backend, config.capture.clone());
        let shared = Arc::new(Shared {
            status: Mutex::new(CameraStatus::Paused),
            status_changed: Subscribers::new(),
            responses: Arc::new(Subscribers::new()),
            session: Mutex::new(None),
            downlink: Arc::new(AudioDownlink::new(audio_output)),
            frames_seen: AtomicU64::new(0),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        capture.on_stopped(move |cause| {
            if let Some(shared) = weak.upgrade() {
                shared.on_capture_stopped(cause);
            }
        });

        if !config.realtime_enabled {
            info!("realtime streaming disabled");
        } else if !is_valid_credential(&config.realtime.api_key) {
            warn!("realtime streaming enabled but no API key configured");
        }

        Self {
            capture,
            shared,
            preview: None,
            connector,
            audio_input,
            encoder: FrameEncoder::new(config.jpeg_quality),
            config,
            disposed: AtomicBool::new(false),
        }
    }

    /// Render the camera into `surface` while scanning.
    pub fn with_preview(mut self, surface: Arc<dyn PreviewSurface>) -> Self {
        self.preview = Some(surface);
        self
    }

    /// Start scanning.
    ///
    /// The first call only initializes the camera (and reports the endpoint
    /// to `on_endpoint_ready` subscribers) unless `scan_after_initialize`
    /// is set. Once initialized, connects a new realtime session in the
    /// background and starts capture.
    pub async fn scan(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(CameraError::Disposed);
        }
        if !self.capture.is_initialized() {
            if let Err(e) = self.capture.initialize() {
                error!("camera initialization failed: {e}");
                return Err(e);
            }
            if !self.config.scan_after_initialize {
                return Ok(());
            }
        }
        if self.capture.is_running() {
            debug!("already scanning");
            return Ok(());
        }

        let session = self.open_realtime_session();
        let consumer = self.frame_consumer(session.as_ref());
        let targets: Vec<Arc<dyn PreviewSurface>> = self.preview.iter().cloned().collect();

        if let Err(e) = self.capture.start(targets, Some(consumer)).await {
            error!("failed to start scanning: {e}");
            self.shared.close_session();
            return Err(e);
        }
        if self.capture.is_running() {
            self.shared.set_status(CameraStatus::Scanning);
        }
        Ok(())
    }

    /// Stop scanning. Does nothing unless the camera is streaming.
    pub fn pause(&self) {
        if !self.capture.is_initialized() || !self.capture.is_running() {
            return;
        }

        self.capture.stop();
        self.shared.set_status(CameraStatus::Paused);
        self.shared.close_session();
        self.shared.downlink.stop();
    }

    /// Pause and release the camera and audio devices. Later calls are no-ops.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pause();
        self.capture.dispose();
        self.shared.close_session();
        self.shared.downlink.dispose();
        debug!("camera feature disposed");
    }

    /// Start the microphone uplink if it is off, stop it if it is on.
    ///
    /// Returns whether the uplink is running afterwards. Needs an active
    /// realtime session.
    pub async fn toggle_audio_uplink(&self) -> bool {
        let session = self.shared.session.lock().clone();
        let Some(session) = session.filter(|s| s.is_active()) else {
            warn!("cannot toggle audio uplink: realtime session not active");
            return false;
        };

        if session.is_audio_uplink_running() {
            session.stop_audio_uplink();
            info!("audio uplink stopped");
            return false;
        }
        let started = session.start_audio_uplink().await;
        if started {
            info!("audio uplink started");
        } else {
            warn!("failed to start audio uplink");
        }
        started
    }

    pub fn status(&self) -> CameraStatus {
        *self.shared.status.lock()
    }

    pub fn is_realtime_active(&self) -> bool {
        self.shared
            .session
            .lock()
            .as_ref()
            .is_some_and(|s| s.is_active())
    }

    pub fn is_initialized(&self) -> bool {
        self.capture.is_initialized()
    }

    pub fn is_running(&self) -> bool {
        self.capture.is_running()
    }

    pub fn endpoint(&self) -> Option<CameraEndpoint> {
        self.capture.endpoint()
    }

    pub fn diagnostics(&self) -> FrameReport {
        self.capture.diagnostics()
    }

    /// Frames seen by the local consumer since creation.
    pub fn frames_seen(&self) -> u64 {
        self.shared.frames_seen.load(Ordering::Acquire)
    }

    /// Called once the camera endpoint is known; the hook for placing the
    /// preview panel at the camera's pose.
    pub fn on_endpoint_ready(
        &self,
        callback: impl Fn(&CameraEndpoint) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.capture.on_endpoint_ready(callback)
    }

    /// Called only when the status actually changes.
    pub fn on_status_changed(
        &self,
        callback: impl Fn(&CameraStatus) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.shared.status_changed.subscribe(callback)
    }

    /// Text the model sends back, across all sessions.
    pub fn on_response(&self, callback: impl Fn(&String) + Send + Sync + 'static) -> SubscriptionId {
        self.shared.responses.subscribe(callback)
    }

    /// Replace the current realtime session with a fresh one and connect it
    /// in the background.
    fn open_realtime_session(&self) -> Option<Arc<RealtimeSession>> {
        self.shared.close_session();
        if !self.config.realtime_enabled || !is_valid_credential(&self.config.realtime.api_key) {
            return None;
        }

        let session = RealtimeSession::new(
            self.config.realtime.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.audio_input),
        );

        let downlink = Arc::clone(&self.shared.downlink);
        session.on_audio_response(move |pcm| downlink.enqueue(pcm.clone()));
        let responses = Arc::clone(&self.shared.responses);
        session.on_response(move |text| responses.emit(text));
        session.on_connection_status(|connected| {
            let status = if *connected { "connected" } else { "disconnected" };
            info!("realtime connection status: {status}");
        });
        session.on_setup_completed(|_| info!("realtime setup completed, audio uplink starting"));

        *self.shared.session.lock() = Some(Arc::clone(&session));

        let connecting = Arc::clone(&session);
        tokio::spawn(async move {
            if connecting.connect().await {
                info!("realtime connection established");
            } else {
                warn!("failed to establish realtime connection");
            }
        });
        Some(session)
    }

    fn frame_consumer(&self, session: Option<&Arc<RealtimeSession>>) -> Arc<dyn FrameConsumer> {
        let mut consumers: Vec<Arc<dyn FrameConsumer>> = vec![Arc::new(LocalFrames {
            shared: Arc::downgrade(&self.shared),
        })];
        if let Some(session) = session {
            consumers.push(Arc::new(RealtimeFrames {
                encoder: self.encoder,
                session: Arc::downgrade(session),
                stats: self.capture.frame_stats(),
            }));
        }
        Arc::new(FanOutConsumer::new(consumers))
    }
}

impl Drop for CameraFeature {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Local side of the fan-out: counts frames and lets them go.
struct LocalFrames {
    shared: Weak<Shared>,
}

impl FrameConsumer for LocalFrames {
    fn on_frame(&self, frame: Arc<RawFrame>, completion: FrameCompletion) {
        if let Some(shared) = self.shared.upgrade() {
            if shared.frames_seen.fetch_add(1, Ordering::AcqRel) == 0 {
                info!("first camera frame: {}x{} {:?}", frame.width, frame.height, frame.format);
            }
        }
        completion.complete();
    }
}

/// Encodes frames to JPEG and offers them to the realtime session.
struct RealtimeFrames {
    encoder: FrameEncoder,
    session: Weak<RealtimeSession>,
    stats: Arc<FrameStats>,
}

impl RealtimeFrames {
    fn forward(&self, frame: &RawFrame) -> std::result::Result<usize, FrameDrop> {
        // Skip the encode while the session cannot take video.
        let session = self
            .session
            .upgrade()
            .filter(|s| s.is_active())
            .ok_or(FrameDrop::Inactive)?;
        let jpeg = self.encoder.encode(frame).map_err(|e| {
            warn!("failed to encode frame: {e}");
            FrameDrop::SendFailed
        })?;
        session.send_video_frame(&jpeg)?;
        Ok(jpeg.data.len())
    }
}

impl FrameConsumer for RealtimeFrames {
    fn on_frame(&self, frame: Arc<RawFrame>, completion: FrameCompletion) {
        match self.forward(&frame) {
            Ok(bytes) => self.stats.record_sent(bytes),
            Err(cause) => self.stats.record_drop(cause),
        }
        drop(frame);
        completion.complete();
    }
}
