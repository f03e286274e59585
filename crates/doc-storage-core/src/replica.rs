use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::doc::{DocClock, DocUpdate};
use crate::error::StorageError;
use crate::hub::{DocUpdateEvent, Subscription};
use crate::merge::DocMerger;
use crate::storage::DocStorage;

/// In-memory document state of one execution context (a tab, a worker).
///
/// Every update, whether authored here, pushed by a peer or loaded from storage, goes
/// through [`DocReplica::apply_update`]. Events carrying this context's own origin are
/// dropped so locally authored updates are never applied twice.
pub struct DocReplica {
    identity: String,
    merger: Arc<dyn DocMerger>,
    docs: DashMap<String, Vec<u8>>,
    applied: AtomicU64,
}

impl DocReplica {
    pub fn new(identity: impl Into<String>, merger: Arc<dyn DocMerger>) -> Self {
        Self {
            identity: identity.into(),
            merger,
            docs: DashMap::new(),
            applied: AtomicU64::new(0),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Number of updates applied so far.
    pub fn applied_count(&self) -> u64 {
        self.applied.load(Ordering::SeqCst)
    }

    /// Current local state of a document.
    pub fn state(&self, doc_id: &str) -> Option<Vec<u8>> {
        self.docs.get(doc_id).map(|bin| bin.clone())
    }

    /// Apply an update to the local state.
    pub fn apply_update(&self, doc_id: &str, bin: &[u8]) -> Result<(), StorageError> {
        let mut entry = self.docs.entry(doc_id.to_string()).or_default();
        let merged = if entry.is_empty() {
            bin.to_vec()
        } else {
            self.merger.merge(&[entry.as_slice(), bin])?
        };
        *entry = merged;
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Handle an update event. Returns whether it was applied.
    pub fn handle_event(&self, event: &DocUpdateEvent) -> Result<bool, StorageError> {
        if event.origin.as_deref() == Some(self.identity.as_str()) {
            debug!(
                "Skipping own update of doc {} from {}",
                event.update.doc_id, self.identity
            );
            return Ok(false);
        }
        self.apply_update(&event.update.doc_id, &event.update.bin)?;
        Ok(true)
    }

    /// Author an update here: apply it locally, then persist it tagged with this
    /// context's identity.
    pub async fn push_local(
        &self,
        storage: &dyn DocStorage,
        update: DocUpdate,
    ) -> Result<DocClock, StorageError> {
        self.apply_update(&update.doc_id, &update.bin)?;
        storage.push_doc_update(update, Some(&self.identity)).await
    }

    /// Feed every update seen by `storage` into this replica.
    pub fn attach(self: &Arc<Self>, storage: &dyn DocStorage) -> Subscription {
        let replica = Arc::clone(self);
        storage.subscribe_doc_update(Arc::new(move |event: &DocUpdateEvent| {
            if let Err(e) = replica.handle_event(event) {
                warn!(
                    "Replica {} failed to apply update of doc {}: {}",
                    replica.identity, event.update.doc_id, e
                );
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc::{timestamp_from_millis, DocRecord};

    /// Joins updates with a separator, enough to observe application order.
    struct JoinMerger;

    impl DocMerger for JoinMerger {
        fn merge(&self, updates: &[&[u8]]) -> Result<Vec<u8>, StorageError> {
            Ok(updates.join(&b'|'))
        }
    }

    fn event(bin: &[u8], origin: Option<&str>) -> DocUpdateEvent {
        DocUpdateEvent {
            update: DocRecord::new("doc", bin.to_vec(), timestamp_from_millis(1)),
            origin: origin.map(str::to_string),
        }
    }

    #[test]
    fn test_own_echo_is_ignored() {
        let replica = DocReplica::new("tabA", Arc::new(JoinMerger));
        replica.apply_update("doc", b"a").unwrap();

        assert!(!replica.handle_event(&event(b"a", Some("tabA"))).unwrap());
        assert_eq!(replica.applied_count(), 1);
        assert_eq!(replica.state("doc").unwrap(), b"a".to_vec());
    }

    #[test]
    fn test_foreign_and_anonymous_updates_are_applied() {
        let replica = DocReplica::new("tabA", Arc::new(JoinMerger));

        assert!(replica.handle_event(&event(b"x", Some("tabB"))).unwrap());
        assert!(replica.handle_event(&event(b"y", None)).unwrap());

        assert_eq!(replica.applied_count(), 2);
        assert_eq!(replica.state("doc").unwrap(), b"x|y".to_vec());
    }
}
