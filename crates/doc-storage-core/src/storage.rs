use std::future::Future;

use async_trait::async_trait;
use tracing::debug;

use crate::doc::{
    next_timestamp, now_timestamp, DocClock, DocClocks, DocRecord, DocUpdate, PendingUpdates,
    Timestamp,
};
use crate::error::StorageError;
use crate::hub::{Subscription, UpdateCallback};

/// Attempts made by `push_doc_update` before giving up on timestamp collisions.
pub const MAX_PUSH_ATTEMPTS: u32 = 10;

/// Per-document CRDT update-log storage.
///
/// One storage instance serves one workspace (`space_id`). Implementations compose
/// an update log, a snapshot store and a clock table; the `Locker` and the channel
/// broadcaster are wired in by the concrete backend.
#[async_trait]
pub trait DocStorage: Send + Sync {
    /// Returns the backend identifier (e.g., "memory", "sqlite", "file").
    fn backend_name(&self) -> &'static str;

    /// Workspace this instance serves.
    fn space_id(&self) -> &str;

    // =========================================================================
    // Update Log
    // =========================================================================

    /// Persist an update under a timestamp strictly greater than any stored for the
    /// document, then notify subscribers and peers.
    async fn push_doc_update(
        &self,
        update: DocUpdate,
        origin: Option<&str>,
    ) -> Result<DocClock, StorageError>;

    /// All not-yet-merged updates of a document, ordered by timestamp.
    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>, StorageError>;

    /// Delete updates that have been folded into a committed snapshot.
    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocRecord],
    ) -> Result<u64, StorageError>;

    /// Number of pending updates of a document.
    async fn get_update_count(&self, doc_id: &str) -> Result<u64, StorageError>;

    /// Pending update counts of every document with a non-empty backlog.
    async fn pending_update_counts(&self) -> Result<Vec<PendingUpdates>, StorageError>;

    // =========================================================================
    // Snapshot Store
    // =========================================================================

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError>;

    /// Write a snapshot unless the stored one is at the same or a newer timestamp.
    /// Returns whether the write was accepted.
    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError>;

    // =========================================================================
    // Clock Table
    // =========================================================================

    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>, StorageError>;

    /// Clocks strictly newer than `after` (all clocks when `after` is `None`).
    async fn get_doc_timestamps(
        &self,
        after: Option<Timestamp>,
    ) -> Result<DocClocks, StorageError>;

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Remove updates, snapshot and clock of a document.
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError>;

    /// Receive every pushed update, local or from a peer on the shared channel.
    fn subscribe_doc_update(&self, callback: UpdateCallback) -> Subscription;
}

/// First timestamp candidate for a push: now, but never at or before the clock.
pub fn initial_push_timestamp(clock: Option<Timestamp>) -> Timestamp {
    let now = now_timestamp();
    match clock {
        Some(clock) if clock >= now => next_timestamp(clock),
        _ => now,
    }
}

/// Run `insert` with increasing timestamp candidates until it stops colliding.
///
/// `insert` must fail with [`StorageError::Conflict`] when the candidate is taken or
/// not newer than the latest stored update. Each collision bumps the candidate by one
/// logical unit; after [`MAX_PUSH_ATTEMPTS`] collisions the last one is returned
/// wrapped in [`StorageError::RetryExhausted`].
pub async fn allocate_timestamp<F, Fut>(
    doc_id: &str,
    initial: Timestamp,
    mut insert: F,
) -> Result<Timestamp, StorageError>
where
    F: FnMut(Timestamp) -> Fut,
    Fut: Future<Output = Result<(), StorageError>>,
{
    let mut timestamp = initial;
    let mut attempt = 1;

    loop {
        match insert(timestamp).await {
            Ok(()) => return Ok(timestamp),
            Err(e) if e.is_conflict() => {
                if attempt >= MAX_PUSH_ATTEMPTS {
                    return Err(StorageError::RetryExhausted {
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                debug!(
                    "Timestamp {} taken for doc {} (attempt {}), retrying",
                    timestamp.timestamp_millis(),
                    doc_id,
                    attempt
                );
                attempt += 1;
                timestamp = next_timestamp(timestamp);
            }
            Err(e) => return Err(e),
        }
    }
}
