//! Process-wide record of an unrecoverable store failure.
//!
//! Once the token database is broken every request would fail with a 500, so
//! the first fatal error is latched here and the server shuts down on it.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::error;

use super::StoreError;

#[derive(Clone)]
pub struct StoreHealth {
    failure: Arc<watch::Sender<Option<String>>>,
}

impl Default for StoreHealth {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreHealth {
    pub fn new() -> Self {
        let (failure, _) = watch::channel(None);
        Self {
            failure: Arc::new(failure),
        }
    }

    /// Latch `err` if it is fatal. Later failures keep the first reason.
    pub fn observe(&self, err: &StoreError) {
        if !err.is_fatal() {
            return;
        }
        let reason = err.to_string();
        let first = self.failure.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        });
        if first {
            error!(error = %err, "token store failed; shutting down");
        }
    }

    /// The first fatal failure, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.borrow().clone()
    }

    /// Resolves once a fatal failure has been observed.
    pub async fn failed(&self) {
        let mut rx = self.failure.subscribe();
        // The sender lives as long as `self`, so this cannot close early.
        let _ = rx.wait_for(Option::is_some).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn io_failure() -> StoreError {
        StoreError::from(redb::StorageError::Io(std::io::Error::other("disk gone")))
    }

    #[tokio::test]
    async fn fatal_error_wakes_waiters() {
        let health = StoreHealth::new();
        let waiter = {
            let health = health.clone();
            tokio::spawn(async move { health.failed().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        health.observe(&io_failure());
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(health.failure().unwrap().contains("disk gone"));
    }

    #[test]
    fn ordinary_errors_are_ignored() {
        let health = StoreHealth::new();
        health.observe(&StoreError::DuplicateId("x".into()));
        health.observe(&StoreError::Codec("bad".into()));
        assert!(health.failure().is_none());
    }

    #[test]
    fn first_failure_is_kept() {
        let health = StoreHealth::new();
        health.observe(&io_failure());
        health.observe(&StoreError::Unavailable(redb::Error::PreviousIo));
        assert!(health.failure().unwrap().contains("disk gone"));
    }
}
