//! Explicit cancellation for agent run loops.
//!
//! A `ShutdownTrigger` is held by whoever owns the trial (the run executor,
//! or the agent CLI's signal handler); every loop that must stop on request
//! holds a cloned `Shutdown`. Dropping the trigger counts as a shutdown
//! request so an abandoned receiver can never outlive its owner.

use tokio::sync::watch;

#[derive(Debug)]
pub struct ShutdownTrigger(watch::Sender<bool>);

/// `None` is a signal with no trigger that stays pending forever
#[derive(Debug, Clone)]
pub struct Shutdown(Option<watch::Receiver<bool>>);

impl Shutdown {
    pub fn channel() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger(tx), Shutdown(Some(rx)))
    }

    /// A signal that never fires
    pub fn never() -> Shutdown {
        Shutdown(None)
    }

    pub fn is_triggered(&self) -> bool {
        match &self.0 {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Resolve once shutdown has been requested
    pub async fn triggered(&mut self) {
        let Some(rx) = self.0.as_mut() else {
            return std::future::pending().await;
        };
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // send_replace works even when every receiver is gone
        self.0.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_trigger_wakes_waiters() {
        let (trigger, shutdown) = Shutdown::channel();
        let mut waiter = shutdown.clone();
        let handle = tokio::spawn(async move { waiter.triggered().await });

        assert!(!shutdown.is_triggered());
        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_dropped_trigger_counts_as_shutdown() {
        let (trigger, mut shutdown) = Shutdown::channel();
        drop(trigger);
        tokio::time::timeout(Duration::from_secs(1), shutdown.triggered())
            .await
            .unwrap();
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn test_never_stays_pending() {
        let mut shutdown = Shutdown::never();
        let res = tokio::time::timeout(Duration::from_millis(50), shutdown.triggered()).await;
        assert!(res.is_err());
        assert!(!shutdown.is_triggered());

        // Clones of a never-firing signal hold no channel
        let copy = shutdown.clone();
        assert!(copy.0.is_none());
        assert!(!copy.is_triggered());
    }
}
