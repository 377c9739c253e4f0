//! Pending work tracking.
//!
//! Every dispatched call holds a [`PendingGuard`] for as long as it runs.
//! [`PendingWork::settled`] waits until the count drops to zero, including
//! work that started while it was waiting.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct PendingWork {
    count: Arc<watch::Sender<usize>>,
}

impl PendingWork {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self {
            count: Arc::new(tx),
        }
    }

    /// Register one unit of in-flight work.
    pub fn begin(&self) -> PendingGuard {
        self.count.send_modify(|n| *n += 1);
        PendingGuard {
            count: self.count.clone(),
        }
    }

    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no work is in flight.
    pub async fn settled(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for PendingWork {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the pending count when dropped.
#[derive(Debug)]
pub struct PendingGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.count.send_modify(|n| *n = n.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn settled_returns_immediately_when_idle() {
        let pending = PendingWork::new();
        tokio::time::timeout(Duration::from_millis(100), pending.settled())
            .await
            .expect("should settle immediately");
    }

    #[tokio::test]
    async fn settled_waits_for_guards() {
        let pending = PendingWork::new();
        let guard = pending.begin();
        assert_eq!(pending.count(), 1);

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.settled().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("should settle after drop")
            .unwrap();
        assert_eq!(pending.count(), 0);
    }

    #[tokio::test]
    async fn work_started_while_waiting_is_included() {
        let pending = PendingWork::new();
        let first = pending.begin();

        let waiter = {
            let pending = pending.clone();
            tokio::spawn(async move { pending.settled().await })
        };

        let second = pending.begin();
        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("should settle")
            .unwrap();
    }
}
