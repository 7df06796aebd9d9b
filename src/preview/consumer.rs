use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::camera::types::RawFrame;

type CompletionFn = Box<dyn FnOnce() + Send>;

/// Signals that a consumer is done with a frame.
///
/// Fires exactly once: either through [`complete`](Self::complete) or when
/// dropped, so a consumer that bails out early cannot wedge the pipeline.
pub struct FrameCompletion {
    on_complete: Option<CompletionFn>,
}

impl FrameCompletion {
    pub fn new(on_complete: impl FnOnce() + Send + 'static) -> Self {
        Self {
            on_complete: Some(Box::new(on_complete)),
        }
    }

    /// A completion with nothing attached.
    pub fn noop() -> Self {
        Self { on_complete: None }
    }

    pub fn complete(mut self) {
        self.fire();
    }

    /// Split into `count` completions that fire this one when the last of
    /// them completes, in any order. `count == 0` completes immediately.
    pub fn split(self, count: usize) -> Vec<FrameCompletion> {
        if count == 0 {
            self.complete();
            return Vec::new();
        }
        if count == 1 {
            return vec![self];
        }

        let remaining = Arc::new(AtomicUsize::new(count));
        let parent = Arc::new(Mutex::new(Some(self)));
        (0..count)
            .map(|_| {
                let remaining = Arc::clone(&remaining);
                let parent = Arc::clone(&parent);
                FrameCompletion::new(move || {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let parent = parent.lock().take();
                        if let Some(parent) = parent {
                            parent.complete();
                        }
                    }
                })
            })
            .collect()
    }

    fn fire(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete();
        }
    }
}

impl Drop for FrameCompletion {
    fn drop(&mut self) {
        self.fire();
    }
}

/// Single-slot frame credit.
///
/// At most one frame holds the credit at a time; the holder's
/// [`FrameCompletion`] gives it back.
#[derive(Clone, Default)]
pub struct InFlightGuard {
    held: Arc<AtomicBool>,
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the credit, or `None` while another frame is still in flight.
    pub fn try_acquire(&self) -> Option<FrameCompletion> {
        self.held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        let held = Arc::clone(&self.held);
        Some(FrameCompletion::new(move || {
            held.store(false, Ordering::Release);
        }))
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Receives frames from a capture session.
///
/// Called on the frame-dispatch thread. Implementations must hand the
/// completion back (or drop it) once they are done with the frame; no
/// further frames are delivered until they do.
pub trait FrameConsumer: Send + Sync {
    fn on_frame(&self, frame: Arc<RawFrame>, completion: FrameCompletion);
}

impl<F> FrameConsumer for F
where
    F: Fn(Arc<RawFrame>, FrameCompletion) + Send + Sync,
{
    fn on_frame(&self, frame: Arc<RawFrame>, completion: FrameCompletion) {
        self(frame, completion)
    }
}

/// Delivers one frame to several consumers and releases it once all of
/// them have completed.
pub struct FanOutConsumer {
    consumers: Vec<Arc<dyn FrameConsumer>>,
}

impl FanOutConsumer {
    pub fn new(consumers: Vec<Arc<dyn FrameConsumer>>) -> Self {
        Self { consumers }
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

impl FrameConsumer for FanOutConsumer {
    fn on_frame(&self, frame: Arc<RawFrame>, completion: FrameCompletion) {
        let children = completion.split(self.consumers.len());
        for (consumer, child) in self.consumers.iter().zip(children) {
            consumer.on_frame(Arc::clone(&frame), child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::types::{PixelFormat, Plane};
    use std::time::Duration;

    fn counter() -> (Arc<AtomicUsize>, FrameCompletion) {
        let fired = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&fired);
        let completion = FrameCompletion::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (fired, completion)
    }

    fn frame() -> Arc<RawFrame> {
        Arc::new(RawFrame::new(
            vec![Plane::packed(vec![0; 3], 3)],
            1,
            1,
            PixelFormat::Rgb24,
            Duration::ZERO,
        ))
    }

    #[test]
    fn completion_fires_once_when_completed() {
        let (fired, completion) = counter();
        completion.complete();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn completion_fires_on_drop() {
        let (fired, completion) = counter();
        drop(completion);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn split_fires_parent_after_last_child_in_any_order() {
        for order in [[0usize, 1, 2], [2, 0, 1], [1, 2, 0]] {
            let (fired, completion) = counter();
            let mut children: Vec<Option<FrameCompletion>> =
                completion.split(3).into_iter().map(Some).collect();

            for (step, idx) in order.iter().enumerate() {
                assert_eq!(fired.load(Ordering::SeqCst), 0, "fired early at step {step}");
                if let Some(child) = children[*idx].take() {
                    child.complete();
                }
            }
            assert_eq!(fired.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn split_into_zero_completes_immediately() {
        let (fired, completion) = counter();
        assert!(completion.split(0).is_empty());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_admits_one_holder_at_a_time() {
        let guard = InFlightGuard::new();
        let first = guard.try_acquire().expect("credit available");
        assert!(guard.is_held());
        assert!(guard.try_acquire().is_none());

        first.complete();
        assert!(!guard.is_held());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn fan_out_releases_guard_after_every_consumer() {
        let guard = InFlightGuard::new();
        let parked = Arc::new(Mutex::new(Vec::new()));
        let park = Arc::clone(&parked);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);

        let consumers: Vec<Arc<dyn FrameConsumer>> = vec![
            Arc::new(move |_frame: Arc<RawFrame>, done: FrameCompletion| {
                park.lock().push(done);
            }),
            Arc::new(move |_frame: Arc<RawFrame>, done: FrameCompletion| {
                s.fetch_add(1, Ordering::SeqCst);
                done.complete();
            }),
        ];
        let fan_out = FanOutConsumer::new(consumers);
        assert_eq!(fan_out.len(), 2);

        let completion = guard.try_acquire().unwrap();
        fan_out.on_frame(frame(), completion);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(guard.is_held(), "one consumer still holds the frame");

        parked.lock().clear();
        assert!(!guard.is_held());
    }

    #[test]
    fn frame_is_released_after_all_consumers_drop_it() {
        let released = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&released);
        let raw = RawFrame::new(vec![], 0, 0, PixelFormat::Rgb24, Duration::ZERO)
            .with_release(move || r.store(true, Ordering::SeqCst));

        let kept = Arc::new(Mutex::new(None));
        let keep = Arc::clone(&kept);
        let consumers: Vec<Arc<dyn FrameConsumer>> = vec![
            Arc::new(move |f: Arc<RawFrame>, _done: FrameCompletion| {
                *keep.lock() = Some(f);
            }),
            Arc::new(|_f: Arc<RawFrame>, _done: FrameCompletion| {}),
        ];
        let fan_out = FanOutConsumer::new(consumers);
        fan_out.on_frame(Arc::new(raw), FrameCompletion::noop());
        assert!(!released.load(Ordering::SeqCst));
        kept.lock().take();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn completion_and_consumer_are_send() {
        fn assert_send<T: Send>() {}
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send::<FrameCompletion>();
        assert_send_sync::<FanOutConsumer>();
    }
}
