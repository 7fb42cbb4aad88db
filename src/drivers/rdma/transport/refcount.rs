//! Reference count with a one-shot release hook.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::warn;

type ReleaseFn = Box<dyn FnOnce() + Send>;

/// Atomic count whose decrement to zero runs the release hook exactly once.
///
/// The count starts at one, owned by whoever created the object.
pub struct RefCount {
    count: AtomicUsize,
    release: Mutex<Option<ReleaseFn>>,
}

impl RefCount {
    pub fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
            release: Mutex::new(None),
        }
    }

    /// Install the hook. Must happen before the count can reach zero.
    pub fn set_release(&self, f: impl FnOnce() + Send + 'static) {
        *self.release.lock() = Some(Box::new(f));
    }

    /// Take a reference. Returns false if the count already hit zero.
    pub fn get(&self) -> bool {
        let mut cur = self.count.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self
                .count
                .compare_exchange_weak(cur, cur + 1, Ordering::Acquire, Ordering::Relaxed)
            {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Drop a reference. Returns true if this call ran the release hook.
    pub fn put(&self) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            // Undo so later callers keep seeing zero.
            self.count.store(0, Ordering::Release);
            warn!("refcount underflow");
            return false;
        }
        if prev != 1 {
            return false;
        }
        let hook = self.release.lock().take();
        if let Some(f) = hook {
            f();
        }
        true
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}
