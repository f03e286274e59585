use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use doc_storage_core::{LockAcquireResult, Locker, StorageError};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

use super::expiry_millis;

/// File-based locker for cross-process deployments.
///
/// Lock files are stored at:
/// `{base_dir}/{space_id}/locks/{doc_id}.lock`
///
/// Each lock file contains JSON with holder_id and expiration. A fresh lock is
/// linked into place only if no file exists, so two processes racing for a free
/// document cannot both win.
#[derive(Debug, Clone)]
pub struct FileLock {
    base_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockFile {
    holder_id: String,
    expires_at_ms: i64,
}

impl FileLock {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    fn locks_dir(&self, space_id: &str) -> PathBuf {
        self.base_dir.join(space_id).join("locks")
    }

    fn lock_path(&self, space_id: &str, doc_id: &str) -> PathBuf {
        self.locks_dir(space_id).join(format!("{}.lock", doc_id))
    }

    async fn ensure_locks_dir(&self, space_id: &str) -> Result<(), StorageError> {
        let dir = self.locks_dir(space_id);
        fs::create_dir_all(&dir).await.map_err(|e| {
            StorageError::Io(format!("Failed to create locks dir {}: {}", dir.display(), e))
        })?;
        Ok(())
    }

    /// Read the current lock file, if it exists and hasn't expired.
    async fn read_lock(&self, path: &Path) -> Option<LockFile> {
        let content = fs::read_to_string(path).await.ok()?;
        match serde_json::from_str::<LockFile>(&content) {
            Ok(lock) if lock.expires_at_ms > chrono::Utc::now().timestamp_millis() => Some(lock),
            Ok(_) => {
                let _ = fs::remove_file(path).await;
                None
            }
            Err(e) => {
                warn!("Removing corrupted lock file {}: {}", path.display(), e);
                let _ = fs::remove_file(path).await;
                None
            }
        }
    }

    /// Create the lock file if none exists. Returns false when another file won.
    ///
    /// The content is written to a private temp file first and hard-linked into
    /// place, so readers never observe a half-written lock.
    async fn create_lock(&self, path: &Path, lock: &LockFile) -> Result<bool, StorageError> {
        let content = serde_json::to_vec(lock).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize lock: {}", e))
        })?;

        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| StorageError::Lock(format!("Failed to create lock file: {}", e)))?;
        file.write_all(&content)
            .await
            .map_err(|e| StorageError::Lock(format!("Failed to write lock file: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| StorageError::Lock(format!("Failed to flush lock file: {}", e)))?;
        drop(file);

        let linked = fs::hard_link(&temp_path, path).await;
        let _ = fs::remove_file(&temp_path).await;

        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(StorageError::Lock(format!(
                "Failed to create lock file {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Overwrite a lock we already hold, atomically.
    async fn renew_lock(&self, path: &Path, lock: &LockFile) -> Result<(), StorageError> {
        let temp_path = path.with_extension("lock.tmp");
        let content = serde_json::to_vec(lock).map_err(|e| {
            StorageError::Serialization(format!("Failed to serialize lock: {}", e))
        })?;

        fs::write(&temp_path, &content)
            .await
            .map_err(|e| StorageError::Lock(format!("Failed to write lock file: {}", e)))?;
        fs::rename(&temp_path, path)
            .await
            .map_err(|e| StorageError::Lock(format!("Failed to rename lock file: {}", e)))?;
        Ok(())
    }
}

#[async_trait]
impl Locker for FileLock {
    fn lock_type(&self) -> &'static str {
        "file"
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        space_id: &str,
        doc_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError> {
        self.ensure_locks_dir(space_id).await?;
        let path = self.lock_path(space_id, doc_id);
        let lock = LockFile {
            holder_id: holder_id.to_string(),
            expires_at_ms: expiry_millis(ttl),
        };

        // Second round covers a lock that expired (and was cleaned up) under us.
        for _ in 0..2 {
            if let Some(existing) = self.read_lock(&path).await {
                if existing.holder_id == holder_id {
                    self.renew_lock(&path, &lock).await?;
                    debug!("Renewed lock on {}/{} for {}", space_id, doc_id, holder_id);
                    return Ok(LockAcquireResult::acquired(lock.expires_at_ms / 1000));
                }

                debug!(
                    "Lock on {}/{} held by {} (requested by {})",
                    space_id, doc_id, existing.holder_id, holder_id
                );
                return Ok(LockAcquireResult::not_acquired(
                    existing.holder_id,
                    existing.expires_at_ms / 1000,
                ));
            }

            if self.create_lock(&path, &lock).await? {
                debug!(
                    "Acquired lock on {}/{} for {} (expires at {})",
                    space_id, doc_id, holder_id, lock.expires_at_ms
                );
                return Ok(LockAcquireResult::acquired(lock.expires_at_ms / 1000));
            }
        }

        // Lost the create race twice; report whoever holds it now.
        let holder = self
            .read_lock(&path)
            .await
            .map(|l| (l.holder_id, l.expires_at_ms / 1000))
            .unwrap_or_else(|| ("unknown".to_string(), 0));
        Ok(LockAcquireResult::not_acquired(holder.0, holder.1))
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(
        &self,
        space_id: &str,
        doc_id: &str,
        holder_id: &str,
    ) -> Result<bool, StorageError> {
        let path = self.lock_path(space_id, doc_id);

        let Some(existing) = self.read_lock(&path).await else {
            debug!(
                "Lock on {}/{} not found for release by {}",
                space_id, doc_id, holder_id
            );
            return Ok(false);
        };

        if existing.holder_id != holder_id {
            debug!(
                "Cannot release lock on {}/{}: held by {} not {}",
                space_id, doc_id, existing.holder_id, holder_id
            );
            return Ok(false);
        }

        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(StorageError::Lock(format!("Failed to delete lock: {}", e)));
            }
        }

        debug!("Released lock on {}/{} by {}", space_id, doc_id, holder_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use tempfile::TempDir;

    fn setup() -> (FileLock, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let lock = FileLock::new(temp_dir.path());
        (lock, temp_dir)
    }

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_acquire_release() {
        let (locker, _temp) = setup();

        let result = locker.acquire("ws", "doc-1", "holder-1", TTL).await.unwrap();
        assert!(result.acquired);
        assert!(result.current_holder.is_none());

        let contended = locker.acquire("ws", "doc-1", "holder-2", TTL).await.unwrap();
        assert!(!contended.acquired);
        assert_eq!(contended.current_holder, Some("holder-1".to_string()));

        assert!(locker.release("ws", "doc-1", "holder-1").await.unwrap());
        assert!(locker.acquire("ws", "doc-1", "holder-2", TTL).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_release_not_owner() {
        let (locker, _temp) = setup();
        locker.acquire("ws", "doc-1", "holder-1", TTL).await.unwrap();

        assert!(!locker.release("ws", "doc-1", "holder-2").await.unwrap());
        assert!(!locker.acquire("ws", "doc-1", "holder-2", TTL).await.unwrap().acquired);
        // The owner re-acquires (renews).
        assert!(locker.acquire("ws", "doc-1", "holder-1", TTL).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_space_isolation() {
        let (locker, _temp) = setup();
        locker.acquire("ws-a", "doc-1", "holder", TTL).await.unwrap();

        let result = locker.acquire("ws-b", "doc-1", "other", TTL).await.unwrap();
        assert!(result.acquired);
    }

    #[tokio::test]
    async fn test_expired_lock() {
        let (locker, _temp) = setup();
        let result = locker
            .acquire("ws", "doc-1", "holder-1", Duration::from_millis(1))
            .await
            .unwrap();
        assert!(result.acquired);

        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(locker.acquire("ws", "doc-1", "holder-2", TTL).await.unwrap().acquired);
    }

    #[tokio::test]
    async fn test_corrupted_lock_file_is_replaced() {
        let (locker, temp) = setup();
        let dir = temp.path().join("ws").join("locks");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("doc-1.lock"), b"not json").unwrap();

        assert!(locker.acquire("ws", "doc-1", "holder-1", TTL).await.unwrap().acquired);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_only_one_racer_wins() {
        let (locker, _temp) = setup();
        let locker = Arc::new(locker);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let locker = locker.clone();
                tokio::spawn(async move {
                    locker
                        .acquire("ws", "doc-1", &format!("holder-{}", i), TTL)
                        .await
                        .unwrap()
                        .acquired
                })
            })
            .collect();

        let winners = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();
        assert_eq!(winners, 1);
    }
}
