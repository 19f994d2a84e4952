use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-upload mutual exclusion for merges.
///
/// Two merges of the same upload would both read and then delete the same
/// chunk keys. Ingestion never takes these locks.
#[derive(Clone, Default)]
pub struct MergeLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

pub struct MergeGuard {
    id: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MergeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, id: &str) -> MergeGuard {
        let lock = self.locks.entry(id.to_string()).or_default().value().clone();
        let guard = lock.lock_owned().await;
        MergeGuard {
            id: id.to_string(),
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Identifiers with a merge running or queued.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for MergeGuard {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own reference left: nobody holds or waits on it.
        self.locks
            .remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}
