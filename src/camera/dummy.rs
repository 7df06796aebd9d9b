use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::camera::backend::{
    CameraBackend, CameraDeviceHandle, ConfigureOutcome, DeviceEventCallback, FrameSink,
    OpenOutcome, OutputTarget, StreamSession,
};
use crate::camera::error::{CameraError, Result, SessionFault};
use crate::camera::types::{
    CameraCharacteristics, CameraDevice, DeviceEvent, DeviceId, PixelFormat, Plane, RawFrame, Size,
};

const LEFT_DEVICE_ID: &str = "dummy:left";
const RIGHT_DEVICE_ID: &str = "dummy:right";
const SENSOR_SIZE: Size = Size::new(320, 240);
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

fn passthrough_device(id: &str, name: &str, position: i32, x_offset: f32) -> CameraDevice {
    CameraDevice {
        id: DeviceId::new(id),
        name: name.to_string(),
        characteristics: CameraCharacteristics {
            source: Some(0),
            position: Some(position),
            lens_pose_translation: Some([x_offset, 0.01, 0.07]),
            lens_pose_rotation: Some([0.0, 0.0, 0.0, 1.0]),
            lens_intrinsic_calibration: Some([
                240.0,
                240.0,
                SENSOR_SIZE.width as f32 / 2.0,
                SENSOR_SIZE.height as f32 / 2.0,
                0.0,
            ]),
            pre_correction_active_array: Some(SENSOR_SIZE),
            output_sizes: vec![SENSOR_SIZE],
        },
    }
}

/// Build a synthetic three-plane YUV 4:2:0 frame.
///
/// Chroma planes use a pixel stride of 2 to mirror the semi-planar layout
/// most camera stacks hand out.
pub fn synthetic_frame(size: Size, sequence: u64) -> RawFrame {
    let (w, h) = (size.width as usize, size.height as usize);
    let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
    let shift = (sequence % 256) as usize;

    let mut y = vec![0u8; w * h];
    for row in 0..h {
        for col in 0..w {
            y[row * w + col] = ((col + row + shift) % 256) as u8;
        }
    }

    let chroma_stride = cw * 2;
    let mut u = vec![0u8; chroma_stride * ch];
    let mut v = vec![0u8; chroma_stride * ch];
    for row in 0..ch {
        for col in 0..cw {
            u[row * chroma_stride + col * 2] = 128u8.wrapping_add((col % 32) as u8);
            v[row * chroma_stride + col * 2] = 128u8.wrapping_sub((row % 32) as u8);
        }
    }

    RawFrame::new(
        vec![
            Plane::packed(y, w),
            Plane::new(u, chroma_stride, 2),
            Plane::new(v, chroma_stride, 2),
        ],
        size.width,
        size.height,
        PixelFormat::Yuv420,
        Duration::from_millis(sequence * FRAME_INTERVAL.as_millis() as u64),
    )
}

#[derive(Default)]
struct DummyState {
    readers: Mutex<Vec<(Size, FrameSink)>>,
    event_callbacks: Mutex<Vec<DeviceEventCallback>>,
    open_devices: AtomicUsize,
    frames_produced: AtomicUsize,
    frames_released: AtomicUsize,
    streaming: AtomicBool,
}

impl DummyState {
    fn deliver(state: &Arc<Self>, frame: RawFrame) -> bool {
        let sink = match state.readers.lock().first() {
            Some((_, sink)) => Arc::clone(sink),
            None => return false,
        };
        let released = Arc::clone(state);
        let frame = frame.with_release(move || {
            released.frames_released.fetch_add(1, Ordering::Relaxed);
        });
        state.frames_produced.fetch_add(1, Ordering::Relaxed);
        sink(frame);
        true
    }
}

/// A simulated passthrough camera pair for running without hardware.
///
/// Reports a left and a right camera with full lens characteristics and,
/// while a repeating request is active, produces synthetic YUV frames at
/// roughly 30 fps. Tests can switch the generator off and push frames by
/// hand, or inject device faults.
///
/// Enable via `DUMMY_CAMERA=1` environment variable.
pub struct DummyBackend {
    devices: Vec<CameraDevice>,
    manual_frames: bool,
    permission: bool,
    open_fault: Option<SessionFault>,
    state: Arc<DummyState>,
}

impl Default for DummyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyBackend {
    /// Create a backend with a left and a right camera.
    pub fn new() -> Self {
        Self {
            devices: vec![
                passthrough_device(LEFT_DEVICE_ID, "Dummy Left Passthrough", 0, -0.032),
                passthrough_device(RIGHT_DEVICE_ID, "Dummy Right Passthrough", 1, 0.032),
            ],
            manual_frames: false,
            permission: true,
            open_fault: None,
            state: Arc::new(DummyState::default()),
        }
    }

    /// Whether the dummy camera is enabled via environment variable.
    pub fn is_enabled() -> bool {
        std::env::var("DUMMY_CAMERA").is_ok_and(|v| v == "1" || v == "true")
    }

    /// Replace the simulated device list.
    pub fn with_devices(mut self, devices: Vec<CameraDevice>) -> Self {
        self.devices = devices;
        self
    }

    /// Disable the frame generator; frames arrive only via [`push_frame`].
    ///
    /// [`push_frame`]: Self::push_frame
    pub fn with_manual_frames(mut self) -> Self {
        self.manual_frames = true;
        self
    }

    /// Report camera permission as missing.
    pub fn without_permission(mut self) -> Self {
        self.permission = false;
        self
    }

    /// Fail every open with the given fault.
    pub fn with_open_fault(mut self, fault: SessionFault) -> Self {
        self.open_fault = Some(fault);
        self
    }

    pub fn left_device_id() -> DeviceId {
        DeviceId::new(LEFT_DEVICE_ID)
    }

    pub fn right_device_id() -> DeviceId {
        DeviceId::new(RIGHT_DEVICE_ID)
    }

    /// Deliver a frame to the active frame reader, if any.
    pub fn push_frame(&self, frame: RawFrame) -> bool {
        DummyState::deliver(&self.state, frame)
    }

    /// Deliver a synthetic frame at the sensor size.
    pub fn push_test_frame(&self) -> bool {
        let seq = self.state.frames_produced.load(Ordering::Relaxed) as u64;
        self.push_frame(synthetic_frame(SENSOR_SIZE, seq))
    }

    /// Notify every open device that the camera went away.
    pub fn simulate_disconnect(&self) {
        self.emit(DeviceEvent::Disconnected);
    }

    /// Notify every open device of a platform error code.
    pub fn simulate_error(&self, code: i32) {
        self.emit(DeviceEvent::Error(code));
    }

    fn emit(&self, event: DeviceEvent) {
        let callbacks: Vec<DeviceEventCallback> =
            self.state.event_callbacks.lock().iter().cloned().collect();
        for cb in callbacks {
            cb(event.clone());
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.state.streaming.load(Ordering::Acquire)
    }

    pub fn open_devices(&self) -> usize {
        self.state.open_devices.load(Ordering::Acquire)
    }

    pub fn frames_produced(&self) -> usize {
        self.state.frames_produced.load(Ordering::Relaxed)
    }

    pub fn frames_released(&self) -> usize {
        self.state.frames_released.load(Ordering::Relaxed)
    }
}

impl CameraBackend for DummyBackend {
    fn enumerate_devices(&self) -> Result<Vec<CameraDevice>> {
        Ok(self.devices.clone())
    }

    fn has_permission(&self) -> bool {
        self.permission
    }

    fn open(&self, id: &DeviceId, outcome: OpenOutcome, on_event: DeviceEventCallback) {
        if !self.devices.iter().any(|d| &d.id == id) {
            outcome.resolve(Err(CameraError::Open {
                id: id.clone(),
                reason: "unknown device".to_string(),
            }));
            return;
        }

        if let Some(fault) = self.open_fault {
            outcome.resolve(Err(CameraError::Session(fault)));
            return;
        }

        info!("dummy camera {id} opened");
        self.state.open_devices.fetch_add(1, Ordering::AcqRel);
        *self.state.event_callbacks.lock() = vec![on_event];

        outcome.resolve(Ok(Box::new(DummyDevice {
            id: id.clone(),
            manual_frames: self.manual_frames,
            state: Arc::clone(&self.state),
            closed: false,
        })));
    }
}

struct DummyDevice {
    id: DeviceId,
    manual_frames: bool,
    state: Arc<DummyState>,
    closed: bool,
}

impl CameraDeviceHandle for DummyDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn create_session(&mut self, outputs: Vec<OutputTarget>, outcome: ConfigureOutcome) {
        if self.closed {
            outcome.resolve(Err(CameraError::Session(SessionFault::Disconnected)));
            return;
        }

        let mut readers = Vec::new();
        for output in outputs {
            match output {
                OutputTarget::Surface(handle) => debug!("dummy camera renders to {}", handle.label),
                OutputTarget::FrameReader { size, format, sink } => {
                    if format != PixelFormat::Yuv420 {
                        outcome.resolve(Err(CameraError::Configure(format!(
                            "unsupported reader format {format:?}"
                        ))));
                        return;
                    }
                    readers.push((size, sink));
                }
            }
        }

        outcome.resolve(Ok(Box::new(DummySession {
            readers,
            manual_frames: self.manual_frames,
            state: Arc::clone(&self.state),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        })));
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state.event_callbacks.lock().clear();
        self.state.open_devices.fetch_sub(1, Ordering::AcqRel);
        info!("dummy camera {} closed", self.id);
    }
}

impl Drop for DummyDevice {
    fn drop(&mut self) {
        self.close();
    }
}

struct DummySession {
    readers: Vec<(Size, FrameSink)>,
    manual_frames: bool,
    state: Arc<DummyState>,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamSession for DummySession {
    fn set_repeating_request(&mut self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        *self.state.readers.lock() = self.readers.clone();
        self.state.streaming.store(true, Ordering::Release);

        if self.manual_frames || self.readers.is_empty() {
            return Ok(());
        }

        let size = self.readers[0].0;
        let running = Arc::clone(&self.running);
        let state = Arc::clone(&self.state);
        let handle = std::thread::Builder::new()
            .name("dummy-camera-frames".to_string())
            .spawn(move || {
                let mut seq = 0u64;
                let mut next = Instant::now();
                while running.load(Ordering::Acquire) {
                    DummyState::deliver(&state, synthetic_frame(size, seq));
                    seq += 1;
                    next += FRAME_INTERVAL;
                    std::thread::sleep(next.saturating_duration_since(Instant::now()));
                }
            })
            .map_err(|e| CameraError::Request(format!("failed to spawn frame thread: {e}")))?;
        self.thread = Some(handle);
        Ok(())
    }

    fn stop_repeating(&mut self) {
        self.running.store(false, Ordering::Release);
        self.state.streaming.store(false, Ordering::Release);
        self.state.readers.lock().clear();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("dummy frame thread panicked");
            }
        }
    }

    fn close(&mut self) {
        self.stop_repeating();
    }
}

impl Drop for DummySession {
    fn drop(&mut self) {
        self.stop_repeating();
    }
}
