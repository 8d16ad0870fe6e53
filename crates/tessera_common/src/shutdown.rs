//! Interruptible shutdown signal for background tasks.
//!
//! Background loops (lease renewal, scheduler ticks, liveness sweeps) wait
//! on this instead of bare sleeps so a stop request is observed within
//! milliseconds rather than after the full interval elapses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;

/// A cooperative shutdown signal for tokio tasks.
///
/// When `shutdown()` is called, any task blocked in `wait_timeout()` wakes
/// immediately.
#[derive(Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Default)]
struct ShutdownInner {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// Create a new signal in the non-shutdown state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal shutdown. Wakes all waiters immediately.
    pub fn shutdown(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if shutdown has been requested (non-blocking).
    pub fn is_shutdown(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Sleep for at most `duration`, waking immediately on `shutdown()`.
    /// Returns `true` if shutdown was requested (caller should exit).
    pub async fn wait_timeout(&self, duration: Duration) -> bool {
        if self.is_shutdown() {
            return true;
        }
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        // Register interest before the re-check so a shutdown racing with
        // it wakes us instead of being lost.
        notified.as_mut().enable();
        if self.is_shutdown() {
            return true;
        }
        tokio::select! {
            _ = &mut notified => {}
            _ = tokio::time::sleep(duration) => {}
        }
        self.is_shutdown()
    }

    /// Wait until shutdown is requested.
    pub async fn wait(&self) {
        while !self.is_shutdown() {
            self.wait_timeout(Duration::from_secs(3600)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_not_shutdown() {
        let sig = ShutdownSignal::new();
        assert!(!sig.is_shutdown());
    }

    #[tokio::test]
    async fn test_shutdown_is_sticky() {
        let sig = ShutdownSignal::new();
        sig.shutdown();
        assert!(sig.is_shutdown());
        assert!(sig.wait_timeout(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn test_wait_timeout_elapses_without_shutdown() {
        let sig = ShutdownSignal::new();
        let requested = sig.wait_timeout(Duration::from_millis(5)).await;
        assert!(!requested);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiter() {
        let sig = ShutdownSignal::new();
        let waiter = sig.clone();
        let handle =
            tokio::spawn(async move { waiter.wait_timeout(Duration::from_secs(30)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        sig.shutdown();
        let requested = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
        assert!(requested);
    }
}
