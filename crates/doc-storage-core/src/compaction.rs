use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::doc::{DocRecord, Timestamp};
use crate::error::StorageError;
use crate::lock::{with_doc_lock, Locker};
use crate::merge::DocMerger;
use crate::storage::DocStorage;

/// Tuning for a single compaction pass.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// TTL of the document lock held during a pass.
    pub lock_ttl: Duration,
    /// Fold at most this many of the oldest pending updates per pass.
    pub batch_limit: Option<usize>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            batch_limit: None,
        }
    }
}

/// What a compaction pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactionOutcome {
    /// No pending updates.
    UpToDate,
    /// Another holder is compacting this document.
    Locked,
    /// A new snapshot was committed and the folded updates were reaped.
    Compacted {
        folded: usize,
        reaped: u64,
        timestamp: Timestamp,
    },
    /// Only leftovers already covered by the snapshot were reaped.
    Reaped { reaped: u64 },
    /// The snapshot write lost to a newer snapshot; nothing was folded.
    Rejected { folded: usize },
}

/// Partition of the pending updates for one pass.
#[derive(Debug, Default)]
struct FoldPlan {
    /// Already covered by the snapshot (timestamp <= snapshot timestamp).
    stale: Vec<DocRecord>,
    /// To be folded, ascending by timestamp.
    fresh: Vec<DocRecord>,
}

impl FoldPlan {
    fn new(
        snapshot: Option<&DocRecord>,
        mut updates: Vec<DocRecord>,
        batch_limit: Option<usize>,
    ) -> Self {
        updates.sort_by_key(|u| u.timestamp);

        let (stale, mut fresh): (Vec<_>, Vec<_>) = match snapshot {
            Some(snapshot) => updates
                .into_iter()
                .partition(|u| u.timestamp <= snapshot.timestamp),
            None => (Vec::new(), updates),
        };

        if let Some(limit) = batch_limit {
            fresh.truncate(limit.max(1));
        }

        Self { stale, fresh }
    }
}

/// Folds pending updates into snapshots, one document at a time.
pub struct DocCompactor {
    storage: Arc<dyn DocStorage>,
    locker: Arc<dyn Locker>,
    merger: Arc<dyn DocMerger>,
    holder_id: String,
    config: CompactionConfig,
}

impl DocCompactor {
    pub fn new(
        storage: Arc<dyn DocStorage>,
        locker: Arc<dyn Locker>,
        merger: Arc<dyn DocMerger>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            storage,
            locker,
            merger,
            holder_id: format!("compactor-{}", uuid::Uuid::new_v4()),
            config,
        }
    }

    pub fn storage(&self) -> &Arc<dyn DocStorage> {
        &self.storage
    }

    pub fn space_id(&self) -> &str {
        self.storage.space_id()
    }

    /// Run one compaction pass for `doc_id` under the document lock.
    ///
    /// The new snapshot is committed before any update is deleted, so a failure
    /// between the two steps only leaves redundant updates behind.
    #[instrument(skip(self), level = "debug", fields(space = %self.storage.space_id()))]
    pub async fn compact(&self, doc_id: &str) -> Result<CompactionOutcome, StorageError> {
        let outcome = with_doc_lock(
            self.locker.clone(),
            self.storage.space_id(),
            doc_id,
            &self.holder_id,
            self.config.lock_ttl,
            || self.compact_locked(doc_id),
        )
        .await?;

        Ok(outcome.unwrap_or(CompactionOutcome::Locked))
    }

    async fn compact_locked(&self, doc_id: &str) -> Result<CompactionOutcome, StorageError> {
        let snapshot = self.storage.get_doc_snapshot(doc_id).await?;
        let updates = self.storage.get_doc_updates(doc_id).await?;
        if updates.is_empty() {
            return Ok(CompactionOutcome::UpToDate);
        }

        let plan = FoldPlan::new(snapshot.as_ref(), updates, self.config.batch_limit);

        if plan.fresh.is_empty() {
            let reaped = self.storage.mark_updates_merged(doc_id, &plan.stale).await?;
            debug!("Reaped {} already merged updates of doc {}", reaped, doc_id);
            return Ok(CompactionOutcome::Reaped { reaped });
        }

        let merged = self.fold(doc_id, snapshot.as_ref(), &plan.fresh)?;
        let timestamp = merged.timestamp;
        let folded = plan.fresh.len();

        if !self.storage.set_doc_snapshot(&merged).await? {
            warn!(
                "Snapshot of doc {} at {} rejected by a newer one, keeping {} updates",
                doc_id,
                timestamp.timestamp_millis(),
                folded
            );
            if !plan.stale.is_empty() {
                self.storage.mark_updates_merged(doc_id, &plan.stale).await?;
            }
            return Ok(CompactionOutcome::Rejected { folded });
        }

        let mut reap = plan.stale;
        reap.extend(plan.fresh);
        let reaped = self.storage.mark_updates_merged(doc_id, &reap).await?;

        info!(
            "Compacted doc {}: folded {} updates, reaped {}",
            doc_id, folded, reaped
        );
        Ok(CompactionOutcome::Compacted {
            folded,
            reaped,
            timestamp,
        })
    }

    /// Merge `updates` (ascending, all newer than `snapshot`) on top of `snapshot`.
    fn fold(
        &self,
        doc_id: &str,
        snapshot: Option<&DocRecord>,
        updates: &[DocRecord],
    ) -> Result<DocRecord, StorageError> {
        let mut parts: Vec<&[u8]> = Vec::with_capacity(updates.len() + 1);
        if let Some(snapshot) = snapshot {
            parts.push(&snapshot.bin);
        }
        parts.extend(updates.iter().map(|u| u.bin.as_slice()));

        let bin = self.merger.merge(&parts)?;
        let timestamp = updates
            .iter()
            .map(|u| u.timestamp)
            .chain(snapshot.map(|s| s.timestamp))
            .max()
            .ok_or_else(|| StorageError::InvalidArgument("nothing to fold".to_string()))?;

        Ok(DocRecord::new(doc_id, bin, timestamp))
    }

    /// Current merged state of a document: snapshot plus every pending update.
    ///
    /// Pending updates are persisted into the snapshot when the document lock is
    /// free; otherwise they are merged in memory only.
    pub async fn get_doc(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        if self.storage.get_update_count(doc_id).await? > 0 {
            let outcome = self.compact(doc_id).await?;
            debug!("Read-path compaction of doc {}: {:?}", doc_id, outcome);
        }

        let snapshot = self.storage.get_doc_snapshot(doc_id).await?;
        let updates = self.storage.get_doc_updates(doc_id).await?;
        let plan = FoldPlan::new(snapshot.as_ref(), updates, None);

        if plan.fresh.is_empty() {
            return Ok(snapshot);
        }
        self.fold(doc_id, snapshot.as_ref(), &plan.fresh).map(Some)
    }
}
