use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::StorageError;

/// Result of a lock acquisition attempt.
#[derive(Debug, Clone)]
pub struct LockAcquireResult {
    /// Whether the lock was acquired.
    pub acquired: bool,
    /// Current holder when the lock is taken by someone else.
    pub current_holder: Option<String>,
    /// Unix timestamp (seconds) when the lock expires.
    pub expires_at: i64,
}

impl LockAcquireResult {
    /// Create a successful acquisition result.
    pub fn acquired(expires_at: i64) -> Self {
        Self {
            acquired: true,
            current_holder: None,
            expires_at,
        }
    }

    /// Create a failed acquisition result (lock held by another).
    pub fn not_acquired(current_holder: impl Into<String>, expires_at: i64) -> Self {
        Self {
            acquired: false,
            current_holder: Some(current_holder.into()),
            expires_at,
        }
    }
}

/// Per-document exclusive lock used by compaction.
///
/// Locks are on the pair `(space_id, doc_id)`. Each lock carries a holder id and
/// a TTL so a crashed holder cannot keep a document locked forever.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Returns the lock implementation name (e.g., "memory", "file").
    fn lock_type(&self) -> &'static str;

    /// Attempt to acquire the lock on `(space_id, doc_id)`.
    ///
    /// Re-acquiring a lock already held by `holder_id` renews it. A lock held by
    /// another holder is reported with `acquired: false`, not as an error.
    async fn acquire(
        &self,
        space_id: &str,
        doc_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError>;

    /// Release a lock. Returns whether `holder_id` held it.
    async fn release(
        &self,
        space_id: &str,
        doc_id: &str,
        holder_id: &str,
    ) -> Result<bool, StorageError>;
}

/// A held document lock. Released explicitly with [`DocLock::release`], or in the
/// background when dropped (error unwinding, task cancellation).
pub struct DocLock {
    locker: Arc<dyn Locker>,
    space_id: String,
    doc_id: String,
    holder_id: String,
    released: bool,
}

impl DocLock {
    /// Try to take the lock. `Ok(None)` means another holder has it.
    pub async fn try_acquire(
        locker: Arc<dyn Locker>,
        space_id: &str,
        doc_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<Option<DocLock>, StorageError> {
        let result = locker.acquire(space_id, doc_id, holder_id, ttl).await?;
        if !result.acquired {
            debug!(
                "Doc {}/{} is locked by {:?}",
                space_id, doc_id, result.current_holder
            );
            return Ok(None);
        }

        Ok(Some(DocLock {
            locker,
            space_id: space_id.to_string(),
            doc_id: doc_id.to_string(),
            holder_id: holder_id.to_string(),
            released: false,
        }))
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub async fn release(mut self) -> Result<bool, StorageError> {
        self.released = true;
        self.locker
            .release(&self.space_id, &self.doc_id, &self.holder_id)
            .await
    }
}

impl Drop for DocLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let locker = self.locker.clone();
        let space_id = std::mem::take(&mut self.space_id);
        let doc_id = std::mem::take(&mut self.doc_id);
        let holder_id = std::mem::take(&mut self.holder_id);

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = locker.release(&space_id, &doc_id, &holder_id).await {
                        warn!("Failed to release lock on {}/{}: {}", space_id, doc_id, e);
                    }
                });
            }
            Err(_) => warn!(
                "Lock on {}/{} dropped outside a runtime, left to expire",
                space_id, doc_id
            ),
        }
    }
}

/// Run `f` while holding the document lock.
///
/// Returns `Ok(None)` without running `f` when the lock is held elsewhere. The lock
/// is released whatever `f` returns.
pub async fn with_doc_lock<F, Fut, T>(
    locker: Arc<dyn Locker>,
    space_id: &str,
    doc_id: &str,
    holder_id: &str,
    ttl: Duration,
    f: F,
) -> Result<Option<T>, StorageError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let Some(lock) = DocLock::try_acquire(locker, space_id, doc_id, holder_id, ttl).await? else {
        return Ok(None);
    };

    let result = f().await;

    if let Err(e) = lock.release().await {
        warn!("Failed to release lock on {}/{}: {}", space_id, doc_id, e);
    }

    result.map(Some)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct TableLocker {
        held: Mutex<HashMap<(String, String), String>>,
        releases: Mutex<u32>,
    }

    #[async_trait]
    impl Locker for TableLocker {
        fn lock_type(&self) -> &'static str {
            "table"
        }

        async fn acquire(
            &self,
            space_id: &str,
            doc_id: &str,
            holder_id: &str,
            _ttl: Duration,
        ) -> Result<LockAcquireResult, StorageError> {
            let mut held = self.held.lock().unwrap();
            let key = (space_id.to_string(), doc_id.to_string());
            match held.get(&key) {
                Some(holder) if holder != holder_id => {
                    Ok(LockAcquireResult::not_acquired(holder.clone(), 0))
                }
                _ => {
                    held.insert(key, holder_id.to_string());
                    Ok(LockAcquireResult::acquired(0))
                }
            }
        }

        async fn release(
            &self,
            space_id: &str,
            doc_id: &str,
            holder_id: &str,
        ) -> Result<bool, StorageError> {
            *self.releases.lock().unwrap() += 1;
            let mut held = self.held.lock().unwrap();
            let key = (space_id.to_string(), doc_id.to_string());
            if held.get(&key).is_some_and(|h| h == holder_id) {
                held.remove(&key);
                return Ok(true);
            }
            Ok(false)
        }
    }

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_with_doc_lock_releases_on_error() {
        let locker = Arc::new(TableLocker::default());

        let result: Result<Option<()>, StorageError> =
            with_doc_lock(locker.clone(), "ws", "doc", "h1", TTL, || async {
                Err(StorageError::Internal("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(*locker.releases.lock().unwrap(), 1);

        // Lock is free again for another holder.
        let lock = DocLock::try_acquire(locker.clone(), "ws", "doc", "h2", TTL)
            .await
            .unwrap();
        assert!(lock.is_some());
    }

    #[tokio::test]
    async fn test_with_doc_lock_skips_when_held() {
        let locker = Arc::new(TableLocker::default());
        let _held = DocLock::try_acquire(locker.clone(), "ws", "doc", "h1", TTL)
            .await
            .unwrap()
            .unwrap();

        let flag = std::sync::atomic::AtomicBool::new(false);
        let ran = &flag;
        let result = with_doc_lock(locker.clone(), "ws", "doc", "h2", TTL, move || async move {
            ran.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();

        assert!(result.is_none());
        assert!(!flag.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_dropped_lock_is_released_in_background() {
        let locker = Arc::new(TableLocker::default());
        {
            let _lock = DocLock::try_acquire(locker.clone(), "ws", "doc", "h1", TTL)
                .await
                .unwrap()
                .unwrap();
        }

        for _ in 0..50 {
            if locker.held.lock().unwrap().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(locker.held.lock().unwrap().is_empty());
    }
}
