//! Process Shutdown Signal
//!
//! Every in-flight RPC races against the shutdown signal of the plugin
//! process it targets. The supervisor holds the [`ShutdownTrigger`] and fires
//! it when the child exits; client stubs hold a [`ShutdownSignal`].
//!
//! ## Design
//!
//! A `tokio::sync::watch` channel carries a single flag. Waiting never misses
//! a shutdown that happened before the wait started, and dropping the trigger
//! without firing leaves waiters pending forever.

use std::sync::Arc;

use tokio::sync::watch;

/// Fires the shutdown signal. Held by whoever owns the process.
#[derive(Debug, Clone)]
pub struct ShutdownTrigger {
    tx: Arc<watch::Sender<bool>>,
}

/// Observes the shutdown signal. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: Option<watch::Receiver<bool>>,
}

/// Create a linked trigger and signal.
pub fn channel() -> (ShutdownTrigger, ShutdownSignal) {
    let (tx, rx) = watch::channel(false);
    (
        ShutdownTrigger { tx: Arc::new(tx) },
        ShutdownSignal { rx: Some(rx) },
    )
}

impl ShutdownTrigger {
    /// Mark the process as gone. Idempotent.
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: Some(self.tx.subscribe()),
        }
    }
}

impl ShutdownSignal {
    /// A signal that never fires. Used by in-process transports.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_shutdown(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once the trigger fires.
    pub async fn wait(&self) {
        let Some(rx) = &self.rx else {
            return std::future::pending().await;
        };
        let mut rx = rx.clone();
        if rx.wait_for(|fired| *fired).await.is_err() {
            // Trigger dropped without firing
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_after_fire_returns_immediately() {
        let (trigger, signal) = channel();
        trigger.fire();
        assert!(signal.is_shutdown());
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .expect("signal should resolve");
    }

    #[tokio::test]
    async fn test_wait_wakes_on_fire() {
        let (trigger, signal) = channel();
        let waiter = tokio::spawn(async move { signal.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.fire();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
    }

    #[tokio::test]
    async fn test_never_and_dropped_trigger_stay_pending() {
        let never = ShutdownSignal::never();
        assert!(!never.is_shutdown());
        assert!(
            tokio::time::timeout(Duration::from_millis(20), never.wait())
                .await
                .is_err()
        );

        let (trigger, signal) = channel();
        drop(trigger);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), signal.wait())
                .await
                .is_err()
        );
    }
}
