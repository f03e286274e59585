use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::doc::DocRecord;

/// A pushed update as seen by subscribers, tagged with the context that authored it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocUpdateEvent {
    pub update: DocRecord,
    #[serde(default)]
    pub origin: Option<String>,
}

pub type UpdateCallback = Arc<dyn Fn(&DocUpdateEvent) + Send + Sync>;

struct HubInner {
    next_id: AtomicU64,
    callbacks: DashMap<u64, UpdateCallback>,
}

/// In-process fan-out of update events to registered callbacks.
#[derive(Clone)]
pub struct UpdateHub {
    inner: Arc<HubInner>,
}

impl Default for UpdateHub {
    fn default() -> Self {
        Self::new()
    }
}

impl UpdateHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_id: AtomicU64::new(1),
                callbacks: DashMap::new(),
            }),
        }
    }

    /// Register a callback. It stays registered until the returned subscription is
    /// dropped or unsubscribed.
    pub fn subscribe(&self, callback: UpdateCallback) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.callbacks.insert(id, callback);
        Subscription {
            hub: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver an event to every registered callback.
    pub fn emit(&self, event: &DocUpdateEvent) {
        // Snapshot first so callbacks may (un)subscribe without deadlocking the map.
        let callbacks: Vec<UpdateCallback> = self
            .inner
            .callbacks
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.callbacks.len()
    }
}

/// Handle returned by `subscribe_doc_update`; dropping it unsubscribes.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    hub: Weak<HubInner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.callbacks.remove(&self.id);
        }
    }
}
