use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = DashMap<String, Arc<Mutex<()>>>;

/// Per-token async locks. Entries live only while someone holds or waits on
/// them.
#[derive(Clone, Default)]
pub struct TokenLocks {
    inner: Arc<LockMap>,
}

/// Exclusive hold on one token id; released on drop.
pub struct TokenGuard {
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<LockMap>,
}

impl TokenLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: &str) -> TokenGuard {
        let mutex = self.inner.entry(id.to_owned()).or_default().clone();
        let guard = mutex.lock_owned().await;
        TokenGuard {
            id: id.to_owned(),
            guard: Some(guard),
            locks: Arc::clone(&self.inner),
        }
    }

    /// Number of tokens with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map's own reference left: nobody is waiting.
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
