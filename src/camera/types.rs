use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Stable camera identifier as reported by the platform camera service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Create a new `DeviceId` from a raw string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which eye a passthrough camera sits in front of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CameraEye {
    #[default]
    Left,
    Right,
    Unknown,
}

impl CameraEye {
    /// Map the vendor "position" characteristic to an eye tag.
    ///
    /// `0` is the left camera, `1` the right one; anything else (or a
    /// missing value) is `Unknown`.
    pub fn from_position(position: Option<i32>) -> Self {
        match position {
            Some(0) => Self::Left,
            Some(1) => Self::Right,
            _ => Self::Unknown,
        }
    }

    /// Parse a lowercase name ("left", "right", "unknown").
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "unknown" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for CameraEye {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Pixel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Static characteristics of a camera, as read from the camera service.
///
/// Every optical field is optional because vendors are free to omit them;
/// endpoint computation fails when the ones it needs are missing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraCharacteristics {
    /// Vendor metadata: which physical camera feeds this id.
    pub source: Option<i32>,
    /// Vendor metadata: 0 = left eye, 1 = right eye.
    pub position: Option<i32>,
    /// Lens translation relative to the head, metres.
    pub lens_pose_translation: Option<[f32; 3]>,
    /// Lens rotation quaternion as `[x, y, z, w]`.
    pub lens_pose_rotation: Option<[f32; 4]>,
    /// `[fx, fy, cx, cy, skew]`.
    pub lens_intrinsic_calibration: Option<[f32; 5]>,
    /// Pre-correction active array, right/bottom edge in pixels.
    pub pre_correction_active_array: Option<Size>,
    /// Output sizes supported for the frame reader format.
    pub output_sizes: Vec<Size>,
}

/// Discovered camera device.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraDevice {
    pub id: DeviceId,
    pub name: String,
    pub characteristics: CameraCharacteristics,
}

/// Pixel layout of a raw frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
    /// Three planes (Y, U, V) with independent row and pixel strides.
    Yuv420,
    /// Y plane followed by interleaved V/U at quarter resolution.
    Nv21,
    /// Y plane followed by interleaved U/V at quarter resolution.
    Nv12,
    /// Packed `[Y0, U, Y1, V]` macro-pixels.
    Yuy2,
    /// Packed 8-bit RGB.
    Rgb24,
    /// Already-compressed JPEG bitstream.
    Jpeg,
    /// 16-bit raw bayer data. No conversion path exists for it.
    Raw16,
}

/// One plane of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plane {
    pub data: Vec<u8>,
    /// Bytes between the starts of two consecutive rows.
    pub row_stride: usize,
    /// Bytes between two consecutive samples in a row.
    pub pixel_stride: usize,
}

impl Plane {
    pub fn new(data: Vec<u8>, row_stride: usize, pixel_stride: usize) -> Self {
        Self {
            data,
            row_stride,
            pixel_stride,
        }
    }

    /// A tightly packed single plane (stride = width * bytes per pixel).
    pub fn packed(data: Vec<u8>, row_stride: usize) -> Self {
        Self::new(data, row_stride, 1)
    }
}

type ReleaseHook = Box<dyn FnOnce() + Send + Sync>;

/// A frame produced by the camera.
///
/// The backend may attach a release hook which runs once the last owner
/// drops the frame, returning the underlying buffer to its pool.
pub struct RawFrame {
    pub planes: Vec<Plane>,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Arrival time relative to the start of the stream.
    pub timestamp: Duration,
    release: Option<ReleaseHook>,
}

impl RawFrame {
    pub fn new(
        planes: Vec<Plane>,
        width: u32,
        height: u32,
        format: PixelFormat,
        timestamp: Duration,
    ) -> Self {
        Self {
            planes,
            width,
            height,
            format,
            timestamp,
            release: None,
        }
    }

    /// Attach a hook run when the frame is released back to the backend.
    pub fn with_release(mut self, hook: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.release = Some(Box::new(hook));
        self
    }

    /// Total payload size across all planes.
    pub fn byte_len(&self) -> usize {
        self.planes.iter().map(|p| p.data.len()).sum()
    }
}

impl fmt::Debug for RawFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("planes", &self.planes.len())
            .field("timestamp", &self.timestamp)
            .finish()
    }
}

impl Drop for RawFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Asynchronous device notifications delivered after a successful open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Disconnected,
    Error(i32),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn eye_from_position_maps_vendor_values() {
        assert_eq!(CameraEye::from_position(Some(0)), CameraEye::Left);
        assert_eq!(CameraEye::from_position(Some(1)), CameraEye::Right);
        assert_eq!(CameraEye::from_position(Some(7)), CameraEye::Unknown);
        assert_eq!(CameraEye::from_position(None), CameraEye::Unknown);
    }

    #[test]
    fn eye_from_name_is_case_insensitive() {
        assert_eq!(CameraEye::from_name("Right"), Some(CameraEye::Right));
        assert_eq!(CameraEye::from_name(" left "), Some(CameraEye::Left));
        assert_eq!(CameraEye::from_name("centre"), None);
    }

    #[test]
    fn device_id_display_matches_inner() {
        let id = DeviceId::new("50");
        assert_eq!(id.to_string(), "50");
        assert_eq!(id.as_str(), "50");
    }

    #[test]
    fn raw_frame_runs_release_hook_once_on_drop() {
        let released = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&released);
        let frame = RawFrame::new(
            vec![Plane::packed(vec![0; 12], 6)],
            2,
            2,
            PixelFormat::Rgb24,
            Duration::ZERO,
        )
        .with_release(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(frame.byte_len(), 12);
        let shared = Arc::new(frame);
        let other = Arc::clone(&shared);
        drop(shared);
        assert_eq!(released.load(Ordering::SeqCst), 0);
        drop(other);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn raw_frame_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RawFrame>();
    }
}
