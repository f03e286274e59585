use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use doc_storage_core::{LockAcquireResult, Locker, StorageError};
use tracing::{debug, instrument};

use super::expiry_millis;

#[derive(Debug, Clone)]
struct Held {
    holder_id: String,
    expires_at_ms: i64,
}

/// In-process lock table for single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryLocker {
    locks: DashMap<(String, String), Held>,
}

impl MemoryLocker {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Locker for MemoryLocker {
    fn lock_type(&self) -> &'static str {
        "memory"
    }

    #[instrument(skip(self), level = "debug")]
    async fn acquire(
        &self,
        space_id: &str,
        doc_id: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> Result<LockAcquireResult, StorageError> {
        let now = chrono::Utc::now().timestamp_millis();
        let expires_at_ms = expiry_millis(ttl);
        let fresh = Held {
            holder_id: holder_id.to_string(),
            expires_at_ms,
        };

        match self.locks.entry((space_id.to_string(), doc_id.to_string())) {
            Entry::Occupied(held)
                if held.get().holder_id != holder_id && held.get().expires_at_ms > now =>
            {
                let current = held.get().clone();
                debug!(
                    "Lock on {}/{} held by {} (requested by {})",
                    space_id, doc_id, current.holder_id, holder_id
                );
                Ok(LockAcquireResult::not_acquired(
                    current.holder_id,
                    current.expires_at_ms / 1000,
                ))
            }
            Entry::Occupied(mut held) => {
                held.insert(fresh);
                Ok(LockAcquireResult::acquired(expires_at_ms / 1000))
            }
            Entry::Vacant(slot) => {
                slot.insert(fresh);
                Ok(LockAcquireResult::acquired(expires_at_ms / 1000))
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn release(
        &self,
        space_id: &str,
        doc_id: &str,
        holder_id: &str,
    ) -> Result<bool, StorageError> {
        let released = self
            .locks
            .remove_if(&(space_id.to_string(), doc_id.to_string()), |_, held| {
                held.holder_id == holder_id
            })
            .is_some();
        Ok(released)
    }
}
