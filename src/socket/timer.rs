//! Cancellable one-shot timer.
//!
//! Heartbeat scheduling needs timers that can be re-armed and must never
//! fire after cancellation. Dropping a [`Timer`] cancels it, so replacing
//! the previous timer in an `Option` slot is the whole re-arm operation.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use tokio::task::JoinHandle;

// ============================================================================
// Timer
// ============================================================================

/// One-shot timer backed by a spawned task.
pub(crate) struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Runs `task` after `delay` unless cancelled first.
    pub(crate) fn after(delay: Duration, task: impl FnOnce() + Send + 'static) -> Self {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
        Self { handle }
    }

    /// Cancels the timer. No-op if it already fired.
    pub(crate) fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_timer_fires() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let _timer = Timer::after(Duration::from_millis(10), move || {
            flag.store(true, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_prevents_firing() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let timer = Timer::after(Duration::from_millis(10), move || {
            flag.store(true, Ordering::SeqCst);
        });

        timer.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_cancels() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        drop(Timer::after(Duration::from_millis(10), move || {
            flag.store(true, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }
}
