use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use subjectcore::errors::LockError;
use subjectcore::lock::{DistributedLock, LockLease};
use tracing::debug;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Process-local lock table implementing [`DistributedLock`].
///
/// Each key gets its own async mutex; waiting for one key never blocks another.
/// A key's mutex is dropped from the table once its last lease is released
/// and nobody waits for it. Leases are not reentrant: acquiring a key twice
/// from the same task waits for the timeout.
#[derive(Clone)]
pub struct InMemoryDistributedLock {
    keys: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
    timeout: Duration,
}

impl InMemoryDistributedLock {
    /// Create a lock table with a five second acquisition timeout
    pub fn new() -> Self {
        Self {
            keys: Arc::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Gives up acquiring after `timeout`.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns `true` if a lease on `key` is currently held.
    pub fn is_locked(&self, key: &str) -> bool {
        self.keys
            .lock()
            .get(key)
            .is_some_and(|mutex| mutex.try_lock().is_err())
    }

    fn mutex_for(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(self.keys.lock().entry(key.to_string()).or_default())
    }

    fn tracked_keys(&self) -> usize {
        self.keys.lock().len()
    }
}

impl Default for InMemoryDistributedLock {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryDistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDistributedLock")
            .field("keys", &self.tracked_keys())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl DistributedLock for InMemoryDistributedLock {
    async fn acquire(&self, key: &str) -> Result<LockLease, LockError> {
        let mutex = self.mutex_for(key);
        let guard = tokio::time::timeout(self.timeout, mutex.lock_owned())
            .await
            .map_err(|_| LockError::Timeout {
                key: key.to_string(),
                waited: self.timeout,
            })?;
        debug!(key, "Lock acquired");
        let keys = Arc::clone(&self.keys);
        let owned_key = key.to_string();
        Ok(LockLease::new(key, move || {
            drop(guard);
            let mut keys = keys.lock();
            // Only the table still refers to the mutex: no holder, no waiter.
            if keys
                .get(&owned_key)
                .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
            {
                keys.remove(&owned_key);
            }
        }))
    }
}
