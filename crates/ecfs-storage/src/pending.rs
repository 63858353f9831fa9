//! Completion counters
//!
//! A [`PendingCounter`] tracks outstanding units of work (chunks of a
//! transfer, blocks of a download, fetches of a repair). Waiters are released
//! exactly when the count reaches zero and never before; there is no
//! deadline.

use ecfs_common::{Error, Result};
use tokio::sync::watch;

#[derive(Debug)]
pub struct PendingCounter {
    tx: watch::Sender<u64>,
}

impl PendingCounter {
    #[must_use]
    pub fn new(pending: u64) -> Self {
        let (tx, _rx) = watch::channel(pending);
        Self { tx }
    }

    /// Current number of outstanding units
    #[must_use]
    pub fn pending(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Account for one finished unit, returning how many remain
    ///
    /// Completing more units than were registered is rejected so a duplicate
    /// completion cannot release a waiter early.
    pub fn complete_one(&self) -> Result<u64> {
        let mut remaining = None;
        self.tx.send_if_modified(|value| {
            if *value == 0 {
                return false;
            }
            *value -= 1;
            remaining = Some(*value);
            true
        });
        remaining.ok_or_else(|| Error::internal("completion counter already at zero"))
    }

    /// Register more outstanding units
    pub fn add(&self, units: u64) {
        self.tx.send_modify(|value| *value += units);
    }

    /// Wait until no units are outstanding
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|value| *value == 0).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_releases_at_zero() {
        let counter = Arc::new(PendingCounter::new(3));

        let waiter = {
            let counter = Arc::clone(&counter);
            tokio::spawn(async move { counter.wait().await })
        };

        assert_eq!(counter.complete_one().unwrap(), 2);
        assert_eq!(counter.complete_one().unwrap(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        assert_eq!(counter.complete_one().unwrap(), 0);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_does_not_block() {
        let counter = PendingCounter::new(0);
        counter.wait().await;
        assert!(counter.complete_one().is_err());
        assert_eq!(counter.pending(), 0);
    }

    #[test]
    fn test_add() {
        let counter = PendingCounter::new(1);
        counter.add(2);
        assert_eq!(counter.pending(), 3);
    }
}
