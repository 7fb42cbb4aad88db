//! One-shot handshake signals.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Single-producer completion flag with a bounded async wait.
///
/// Once completed it stays completed; waiters arriving later return at once.
#[derive(Debug, Default)]
pub struct Signal {
    done: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.notify.notify_waiters();
        }
    }

    pub fn is_complete(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Wait until completed. Returns false on timeout.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // Register before re-checking so a concurrent complete() is not missed.
                notified.as_mut().enable();
                if self.is_complete() {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_signal_completed_before_wait() {
        let sig = Signal::new();
        sig.complete();
        assert!(sig.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_signal_completed_from_thread() {
        let sig = Arc::new(Signal::new());
        let s = sig.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            s.complete();
        });
        assert!(sig.wait_timeout(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_signal_timeout() {
        let sig = Signal::new();
        assert!(!sig.wait_timeout(Duration::from_millis(20)).await);
        assert!(!sig.is_complete());
    }
}
