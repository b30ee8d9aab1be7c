//! One-shot shutdown broadcast.
//!
//! The signal moves from "running" to "shutting down" once and never back.
//! Every listener observes the transition, including listeners subscribed
//! after it happened.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// Broadcast side of the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Fire the signal.
    ///
    /// Returns `true` for the call that fired it; later calls change nothing
    /// and return `false`.
    pub fn trigger(&self) -> bool {
        let fired = self.tx.send_if_modified(|triggered| {
            if *triggered {
                false
            } else {
                *triggered = true;
                true
            }
        });
        if !fired {
            debug!("shutdown already triggered");
        }
        fired
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    #[must_use]
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of the shutdown signal.
#[derive(Debug, Clone)]
pub struct ShutdownListener {
    rx: watch::Receiver<bool>,
}

impl ShutdownListener {
    /// Resolve once the signal has fired. Returns immediately if it already
    /// has, so it can be polled repeatedly inside `select!`.
    ///
    /// A dropped [`ShutdownSignal`] counts as shutdown.
    pub async fn wait(&mut self) {
        let _ = self.rx.wait_for(|triggered| *triggered).await;
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_second_trigger_is_noop() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_every_listener_observes_trigger() {
        let signal = ShutdownSignal::new();
        let mut waiters = Vec::new();
        for _ in 0..4 {
            let mut listener = signal.subscribe();
            waiters.push(tokio::spawn(async move { listener.wait().await }));
        }

        signal.trigger();
        for waiter in waiters {
            tokio::time::timeout(Duration::from_secs(1), waiter)
                .await
                .expect("listener should observe shutdown")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_sees_trigger() {
        let signal = ShutdownSignal::new();
        signal.trigger();

        let mut listener = signal.subscribe();
        assert!(listener.is_triggered());
        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("wait should return immediately");
        // and again
        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("wait should keep returning");
    }

    #[tokio::test]
    async fn test_dropped_signal_counts_as_shutdown() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();
        drop(signal);

        tokio::time::timeout(Duration::from_millis(100), listener.wait())
            .await
            .expect("dropped sender should release listeners");
    }

    #[tokio::test]
    async fn test_pending_until_triggered() {
        let signal = ShutdownSignal::new();
        let mut listener = signal.subscribe();
        let pending = tokio::time::timeout(Duration::from_millis(50), listener.wait()).await;
        assert!(pending.is_err());
    }
}
