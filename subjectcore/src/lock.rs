//! Distributed lock capability.
//!
//! The engine never decides how locks are implemented. A host hands in a
//! [`DistributedLock`] and the router or an event handling worker holds a
//! [`LockLease`] for as long as it works on the locked key. The lease releases
//! the lock when dropped, so every exit path (success, business error,
//! infrastructure error, cancellation) gives it back.

use crate::errors::LockError;
use async_trait::async_trait;
use std::future::Future;

/// Acquires mutually exclusive leases on string keys.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Waits for the lock on `key` and returns a lease holding it.
    ///
    /// # Errors
    /// * `LockError::Timeout` - If the lock could not be acquired in time
    /// * `LockError::Backend` - If the lock backend failed
    async fn acquire(&self, key: &str) -> Result<LockLease, LockError>;
}

/// A held lock, released when dropped.
pub struct LockLease {
    key: String,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl LockLease {
    /// Creates a lease on `key` that runs `release` exactly once when dropped.
    pub fn new(key: impl Into<String>, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            key: key.into(),
            release: Some(Box::new(release)),
        }
    }

    /// The locked key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Releases the lock now.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            tracing::trace!(key = %self.key, "Releasing lock");
            release();
        }
    }
}

impl std::fmt::Debug for LockLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockLease").field("key", &self.key).finish()
    }
}

/// Runs `body` while holding the lock on `key`.
pub async fn with_lock<F, Fut, T>(
    lock: &dyn DistributedLock,
    key: &str,
    body: F,
) -> Result<T, LockError>
where
    F: FnOnce() -> Fut + Send,
    Fut: Future<Output = T> + Send,
{
    let _lease = lock.acquire(key).await?;
    Ok(body().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingLock {
        held: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DistributedLock for CountingLock {
        async fn acquire(&self, key: &str) -> Result<LockLease, LockError> {
            self.held.fetch_add(1, Ordering::SeqCst);
            let held = Arc::clone(&self.held);
            let releases = Arc::clone(&self.releases);
            Ok(LockLease::new(key, move || {
                held.fetch_sub(1, Ordering::SeqCst);
                releases.fetch_add(1, Ordering::SeqCst);
            }))
        }
    }

    fn counting_lock() -> CountingLock {
        CountingLock {
            held: Arc::new(AtomicUsize::new(0)),
            releases: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[tokio::test]
    async fn lease_is_released_exactly_once_on_drop() {
        let lock = counting_lock();

        let lease = lock.acquire("/book/1").await.unwrap();
        assert_eq!(lease.key(), "/book/1");
        assert_eq!(lock.held.load(Ordering::SeqCst), 1);

        lease.release();
        assert_eq!(lock.held.load(Ordering::SeqCst), 0);
        assert_eq!(lock.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn with_lock_holds_the_lease_around_the_body() {
        let lock = counting_lock();
        let held = Arc::clone(&lock.held);

        let observed = with_lock(&lock, "/book/1", || async move { held.load(Ordering::SeqCst) })
            .await
            .unwrap();

        assert_eq!(observed, 1);
        assert_eq!(lock.held.load(Ordering::SeqCst), 0);
    }
}
