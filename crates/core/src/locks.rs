use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key async advisory locks. Entries are created on first use and
/// dropped when the last lease on them is released.
#[derive(Debug, Clone, Default)]
pub struct DocumentLocks {
    inner: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> DocumentLease {
        let mutex = self
            .inner
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;

        DocumentLease {
            key: key.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.inner),
        }
    }

    /// Keys with a live or queued lease.
    pub fn active(&self) -> usize {
        self.inner.len()
    }
}

#[derive(Debug)]
pub struct DocumentLease {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl DocumentLease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for DocumentLease {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
