use std::fmt;
use std::sync::Arc;

use crate::camera::error::Result;
use crate::camera::oneshot::OneShot;
use crate::camera::types::{CameraDevice, DeviceEvent, DeviceId, PixelFormat, RawFrame, Size};

/// Opaque renderable target provided by a preview surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SurfaceHandle {
    pub id: u64,
    pub label: String,
}

impl SurfaceHandle {
    pub fn new(id: u64, label: impl Into<String>) -> Self {
        Self {
            id,
            label: label.into(),
        }
    }
}

/// Receives frames produced for a frame-reader output.
///
/// Called on the backend's delivery thread; must not block.
pub type FrameSink = Arc<dyn Fn(RawFrame) + Send + Sync>;

/// Receives asynchronous notifications for an opened device.
pub type DeviceEventCallback = Arc<dyn Fn(DeviceEvent) + Send + Sync>;

/// One output of a capture stream.
#[derive(Clone)]
pub enum OutputTarget {
    /// Frames rendered straight into a preview surface.
    Surface(SurfaceHandle),
    /// Frames delivered in memory to a sink.
    FrameReader {
        size: Size,
        format: PixelFormat,
        sink: FrameSink,
    },
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Surface(handle) => f.debug_tuple("Surface").field(handle).finish(),
            Self::FrameReader { size, format, .. } => f
                .debug_struct("FrameReader")
                .field("size", size)
                .field("format", format)
                .finish_non_exhaustive(),
        }
    }
}

/// Outcome of an asynchronous open.
pub type OpenOutcome = OneShot<Result<Box<dyn CameraDeviceHandle>>>;

/// Outcome of an asynchronous session configuration.
pub type ConfigureOutcome = OneShot<Result<Box<dyn StreamSession>>>;

/// Platform-agnostic camera backend trait.
///
/// Opening and configuring are asynchronous on every camera stack we target:
/// the backend resolves the supplied [`OneShot`] from its own callback
/// thread, exactly once. Device events arrive on `on_event` for as long as
/// the device stays open.
pub trait CameraBackend: Send + Sync {
    /// Enumerate all camera devices and their characteristics.
    fn enumerate_devices(&self) -> Result<Vec<CameraDevice>>;

    /// Whether the process holds camera permission.
    fn has_permission(&self) -> bool {
        true
    }

    /// Begin opening a device.
    fn open(&self, id: &DeviceId, outcome: OpenOutcome, on_event: DeviceEventCallback);
}

/// An opened camera device.
pub trait CameraDeviceHandle: Send {
    fn id(&self) -> &DeviceId;

    /// Begin configuring a capture stream over `outputs`.
    fn create_session(&mut self, outputs: Vec<OutputTarget>, outcome: ConfigureOutcome);

    /// Close the device. Idempotent.
    fn close(&mut self);
}

/// A configured capture stream.
pub trait StreamSession: Send {
    /// Start a repeating capture request targeting every configured output.
    fn set_repeating_request(&mut self) -> Result<()>;

    /// Halt the repeating request. Idempotent.
    fn stop_repeating(&mut self);

    /// Close the session. Idempotent.
    fn close(&mut self);
}
