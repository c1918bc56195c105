use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

/// Counting barrier for one pause event.
///
/// Starts with one lock per listener observed when the pause was emitted.
/// The release callback fires exactly once, when the last lock is released.
/// There is no timeout: a listener that never releases holds the barrier
/// forever.
pub struct LifecycleBarrier {
    remaining: AtomicUsize,
    released: AtomicBool,
    on_release: Mutex<Option<ReleaseCallback>>,
}

impl LifecycleBarrier {
    /// Create a barrier with `locks` outstanding locks. With zero locks the
    /// callback fires before this returns.
    pub fn new(locks: usize, on_release: impl FnOnce() + Send + 'static) -> Arc<Self> {
        let barrier = Arc::new(Self {
            remaining: AtomicUsize::new(locks),
            released: AtomicBool::new(false),
            on_release: Mutex::new(Some(Box::new(on_release))),
        });
        if locks == 0 {
            barrier.fire();
        }
        barrier
    }

    /// Release one lock. Calls after the count reached zero do nothing.
    pub fn release(&self) {
        match self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.fire(),
            Ok(_) => {}
            Err(_) => debug!("Barrier already released, ignoring extra release"),
        }
    }

    pub fn remaining(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    fn fire(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let callback = self.on_release.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }
}

impl std::fmt::Debug for LifecycleBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleBarrier")
            .field("remaining", &self.remaining())
            .field("released", &self.is_released())
            .finish()
    }
}

/// One pause listener's hold on a [`LifecycleBarrier`].
///
/// Clones share the same hold, so releasing any of them more than once still
/// counts as a single release.
#[derive(Debug, Clone)]
pub struct PauseLock {
    barrier: Arc<LifecycleBarrier>,
    event_id: Option<Arc<str>>,
    released: Arc<AtomicBool>,
}

impl PauseLock {
    pub(crate) fn new(barrier: Arc<LifecycleBarrier>, event_id: Option<Arc<str>>) -> Self {
        Self {
            barrier,
            event_id,
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signal that this listener is done reacting to the pause.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.barrier.release();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Id the host attached to the pause, if any.
    pub fn event_id(&self) -> Option<&str> {
        self.event_id.as_deref()
    }
}
