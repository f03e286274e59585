use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::doc::DocRecord;
use crate::error::StorageError;
use crate::hub::{DocUpdateEvent, Subscription, UpdateCallback, UpdateHub};

/// Message exchanged between storage instances sharing one root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Update {
        /// Storage instance that posted the message.
        sender: String,
        #[serde(flatten)]
        event: DocUpdateEvent,
    },
}

/// Channel shared by co-located execution contexts (tabs, workers) on the same root.
pub trait Broadcaster: Send + Sync {
    fn post(&self, message: ChannelMessage) -> Result<(), StorageError>;

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage>;
}

/// In-process broadcast channel. Clones share the same channel.
#[derive(Debug, Clone)]
pub struct LocalChannel {
    tx: broadcast::Sender<ChannelMessage>,
}

impl LocalChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for LocalChannel {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Broadcaster for LocalChannel {
    fn post(&self, message: ChannelMessage) -> Result<(), StorageError> {
        // No receivers is fine: nobody else has the root open.
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChannelMessage> {
        self.tx.subscribe()
    }
}

/// Connects one storage instance to a shared channel.
///
/// Outgoing events are tagged with this instance's sender id; incoming messages from
/// other instances are re-emitted on the local hub. Messages posted by this instance
/// are never delivered back to it.
pub struct ChannelBridge {
    channel: Arc<dyn Broadcaster>,
    sender_id: String,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelBridge {
    pub fn new(channel: Arc<dyn Broadcaster>) -> Self {
        Self {
            channel,
            sender_id: uuid::Uuid::new_v4().to_string(),
            listener: Mutex::new(None),
        }
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    /// Post a locally pushed update to the other instances.
    pub fn post(&self, event: &DocUpdateEvent) -> Result<(), StorageError> {
        self.channel.post(ChannelMessage::Update {
            sender: self.sender_id.clone(),
            event: event.clone(),
        })
    }

    /// Start forwarding channel messages into `hub`, once.
    pub fn ensure_listening(&self, hub: &UpdateHub) {
        let mut listener = match self.listener.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if listener.is_some() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available, channel messages will not be received");
            return;
        };

        // Subscribe before spawning so nothing posted after this call is missed.
        let mut rx = self.channel.subscribe();
        let hub = hub.clone();
        let own_id = self.sender_id.clone();

        *listener = Some(runtime.spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ChannelMessage::Update { sender, event }) => {
                        if sender == own_id {
                            continue;
                        }
                        hub.emit(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Channel listener lagged, {} messages dropped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Channel closed, stopping listener");
                        break;
                    }
                }
            }
        }));
    }
}

impl Drop for ChannelBridge {
    fn drop(&mut self) {
        let listener = match self.listener.get_mut() {
            Ok(listener) => listener.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = listener {
            handle.abort();
        }
    }
}

/// Update event plumbing shared by the backends: the in-process hub plus an optional
/// bridge to a cross-context channel.
#[derive(Default)]
pub struct UpdateNotifier {
    hub: UpdateHub,
    bridge: Option<ChannelBridge>,
}

impl UpdateNotifier {
    pub fn new(channel: Option<Arc<dyn Broadcaster>>) -> Self {
        Self {
            hub: UpdateHub::new(),
            bridge: channel.map(ChannelBridge::new),
        }
    }

    /// Emit a freshly persisted update locally and post it to peers.
    ///
    /// The update is already durable here, so a failed post is only logged.
    pub fn notify(&self, update: DocRecord, origin: Option<&str>) {
        let event = DocUpdateEvent {
            update,
            origin: origin.map(str::to_string),
        };

        self.hub.emit(&event);

        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.post(&event) {
                warn!(
                    "Failed to broadcast update for doc {}: {}",
                    event.update.doc_id, e
                );
            }
        }
    }

    pub fn subscribe(&self, callback: UpdateCallback) -> Subscription {
        if let Some(bridge) = &self.bridge {
            bridge.ensure_listening(&self.hub);
        }
        self.hub.subscribe(callback)
    }
}
