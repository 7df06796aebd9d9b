use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::warn;

struct Inner<T> {
    label: &'static str,
    consumed: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

/// Single-fire result handle for asynchronous hardware outcomes.
///
/// Backends resolve it from whichever callback fires first (opened, error,
/// disconnected). Clones share the same slot; only the first `resolve` is
/// delivered and later ones are logged and ignored.
pub struct OneShot<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for OneShot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> OneShot<T> {
    /// Create a handle and the receiver that observes its single outcome.
    pub fn channel(label: &'static str) -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let handle = Self {
            inner: Arc::new(Inner {
                label,
                consumed: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
            }),
        };
        (handle, rx)
    }

    /// Deliver the outcome. Returns `false` if it was already resolved.
    pub fn resolve(&self, value: T) -> bool {
        if self
            .inner
            .consumed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("{}: outcome already delivered, ignoring", self.inner.label);
            return false;
        }

        if let Some(tx) = self.inner.tx.lock().take() {
            // The waiter may have given up (timeout, stop); nothing to do then.
            let _ = tx.send(value);
        }
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.consumed.load(Ordering::Acquire)
    }
}
