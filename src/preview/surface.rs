use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crate::camera::backend::SurfaceHandle;

/// A local display the camera can render into directly.
///
/// The renderer owns the surface and may not have a renderable target yet
/// when capture starts; the capture session polls [`is_available`] before
/// opening the stream.
///
/// [`is_available`]: PreviewSurface::is_available
pub trait PreviewSurface: Send + Sync {
    fn target(&self) -> Option<SurfaceHandle>;

    fn is_available(&self) -> bool;
}

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

/// Surface for headless runs. Becomes available when told to.
pub struct HeadlessSurface {
    handle: SurfaceHandle,
    available: AtomicBool,
}

impl HeadlessSurface {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            handle: SurfaceHandle::new(NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed), label),
            available: AtomicBool::new(false),
        })
    }

    /// A surface that is renderable from the start.
    pub fn ready(label: impl Into<String>) -> Arc<Self> {
        let surface = Self::new(label);
        surface.set_available(true);
        surface
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }
}

impl PreviewSurface for HeadlessSurface {
    fn target(&self) -> Option<SurfaceHandle> {
        self.is_available().then(|| self.handle.clone())
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}
