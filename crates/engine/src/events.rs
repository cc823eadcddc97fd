//! Event bus collaborator

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

use crate::registry::ConnectionKind;

/// State changes announced to the rest of the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum DirectoryEvent {
    /// A device record was auto-provisioned
    #[serde(rename_all = "camelCase")]
    DeviceAdded {
        device_id: String,
        group_id: String,
        name: String,
    },

    /// A device gained or lost its last connection of a kind
    #[serde(rename_all = "camelCase")]
    Connectivity {
        device_id: String,
        group_id: String,
        kind: ConnectionKind,
        connected: bool,
    },
}

pub trait EventBus: Send + Sync {
    /// Publish an event to subscribers of `scope` (usually a group key)
    fn publish(&self, scope: &str, event: DirectoryEvent);
}

/// Event bus over a tokio broadcast channel
pub struct BroadcastBus {
    tx: broadcast::Sender<(String, DirectoryEvent)>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<(String, DirectoryEvent)> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, scope: &str, event: DirectoryEvent) {
        info!("Event [{}]: {:?}", scope, event);
        // No subscribers is fine
        let _ = self.tx.send((scope.to_string(), event));
    }
}
