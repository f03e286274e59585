use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use doc_storage_core::{
    allocate_timestamp, initial_push_timestamp, Broadcaster, DocClock, DocClocks, DocRecord,
    DocStorage, DocUpdate, PendingUpdates, StorageError, Subscription, Timestamp,
    UpdateCallback, UpdateNotifier,
};
use tracing::{debug, instrument};

/// Everything stored for one document.
#[derive(Debug, Default)]
struct DocEntry {
    updates: BTreeMap<Timestamp, DocRecord>,
    snapshot: Option<DocRecord>,
    clock: Option<Timestamp>,
}

type SpaceTables = Arc<DashMap<String, DocEntry>>;

/// In-process key-value root. Storage instances opened on the same root and
/// workspace see the same documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryRoot {
    spaces: Arc<DashMap<String, SpaceTables>>,
}

impl MemoryRoot {
    fn tables(&self, space_id: &str) -> SpaceTables {
        self.spaces
            .entry(space_id.to_string())
            .or_default()
            .clone()
    }
}

/// In-memory storage backend.
///
/// Each document entry is guarded by its map shard, so the ordering check and the
/// insert of a push happen atomically.
pub struct MemoryDocStorage {
    space_id: String,
    docs: SpaceTables,
    notifier: UpdateNotifier,
}

impl MemoryDocStorage {
    pub fn open(
        root: &MemoryRoot,
        space_id: impl Into<String>,
        channel: Option<Arc<dyn Broadcaster>>,
    ) -> Self {
        let space_id = space_id.into();
        Self {
            docs: root.tables(&space_id),
            space_id,
            notifier: UpdateNotifier::new(channel),
        }
    }

    fn clock_of(&self, doc_id: &str) -> Option<Timestamp> {
        self.docs.get(doc_id).and_then(|entry| entry.clock)
    }

    fn insert_update(&self, record: DocRecord) -> Result<(), StorageError> {
        let mut entry = self.docs.entry(record.doc_id.clone()).or_default();
        if entry.clock.is_some_and(|clock| clock >= record.timestamp) {
            return Err(StorageError::Conflict(format!(
                "Doc {} already has an update at or after {}",
                record.doc_id,
                record.timestamp.timestamp_millis()
            )));
        }

        entry.clock = Some(record.timestamp);
        entry.updates.insert(record.timestamp, record);
        Ok(())
    }
}

#[async_trait]
impl DocStorage for MemoryDocStorage {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    fn space_id(&self) -> &str {
        &self.space_id
    }

    #[instrument(skip(self, update), level = "debug", fields(doc_id = %update.doc_id))]
    async fn push_doc_update(
        &self,
        update: DocUpdate,
        origin: Option<&str>,
    ) -> Result<DocClock, StorageError> {
        let DocUpdate {
            doc_id,
            bin,
            editor,
        } = update;

        let initial = initial_push_timestamp(self.clock_of(&doc_id));
        let timestamp = allocate_timestamp(&doc_id, initial, |candidate| {
            let record = DocRecord {
                doc_id: doc_id.clone(),
                bin: bin.clone(),
                timestamp: candidate,
                editor: editor.clone(),
            };
            std::future::ready(self.insert_update(record))
        })
        .await?;

        debug!("Pushed update of doc {} at {}", doc_id, timestamp.timestamp_millis());
        self.notifier.notify(
            DocRecord {
                doc_id: doc_id.clone(),
                bin,
                timestamp,
                editor,
            },
            origin,
        );

        Ok(DocClock { doc_id, timestamp })
    }

    async fn get_doc_updates(&self, doc_id: &str) -> Result<Vec<DocRecord>, StorageError> {
        Ok(self
            .docs
            .get(doc_id)
            .map(|entry| entry.updates.values().cloned().collect())
            .unwrap_or_default())
    }

    #[instrument(skip(self, updates), level = "debug", fields(count = updates.len()))]
    async fn mark_updates_merged(
        &self,
        doc_id: &str,
        updates: &[DocRecord],
    ) -> Result<u64, StorageError> {
        let Some(mut entry) = self.docs.get_mut(doc_id) else {
            return Ok(0);
        };

        let removed = updates
            .iter()
            .filter(|u| entry.updates.remove(&u.timestamp).is_some())
            .count();
        Ok(removed as u64)
    }

    async fn get_update_count(&self, doc_id: &str) -> Result<u64, StorageError> {
        Ok(self
            .docs
            .get(doc_id)
            .map(|entry| entry.updates.len() as u64)
            .unwrap_or(0))
    }

    async fn pending_update_counts(&self) -> Result<Vec<PendingUpdates>, StorageError> {
        Ok(self
            .docs
            .iter()
            .filter(|entry| !entry.updates.is_empty())
            .map(|entry| PendingUpdates {
                space_id: self.space_id.clone(),
                doc_id: entry.key().clone(),
                count: entry.updates.len() as u64,
            })
            .collect())
    }

    async fn get_doc_snapshot(&self, doc_id: &str) -> Result<Option<DocRecord>, StorageError> {
        Ok(self
            .docs
            .get(doc_id)
            .and_then(|entry| entry.snapshot.clone()))
    }

    #[instrument(skip(self, snapshot), level = "debug", fields(doc_id = %snapshot.doc_id))]
    async fn set_doc_snapshot(&self, snapshot: &DocRecord) -> Result<bool, StorageError> {
        let mut entry = self.docs.entry(snapshot.doc_id.clone()).or_default();
        if entry
            .snapshot
            .as_ref()
            .is_some_and(|current| current.timestamp >= snapshot.timestamp)
        {
            return Ok(false);
        }

        entry.snapshot = Some(snapshot.clone());
        entry.clock = entry.clock.max(Some(snapshot.timestamp));
        Ok(true)
    }

    async fn get_doc_timestamp(&self, doc_id: &str) -> Result<Option<DocClock>, StorageError> {
        Ok(self.clock_of(doc_id).map(|timestamp| DocClock {
            doc_id: doc_id.to_string(),
            timestamp,
        }))
    }

    async fn get_doc_timestamps(
        &self,
        after: Option<Timestamp>,
    ) -> Result<DocClocks, StorageError> {
        Ok(self
            .docs
            .iter()
            .filter_map(|entry| {
                let clock = entry.clock?;
                after
                    .is_none_or(|after| clock > after)
                    .then(|| (entry.key().clone(), clock))
            })
            .collect())
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_doc(&self, doc_id: &str) -> Result<(), StorageError> {
        self.docs.remove(doc_id);
        Ok(())
    }

    fn subscribe_doc_update(&self, callback: UpdateCallback) -> Subscription {
        self.notifier.subscribe(callback)
    }
}
