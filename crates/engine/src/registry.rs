//! Registry of live device connections
//!
//! Maps device keys to their physical connections and announces presence
//! changes on the event bus. Announcing a new connection is deferred so its
//! bound ports are known by the time consumers react.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use crate::events::{DirectoryEvent, EventBus};
use crate::handle::ConnectionHandle;
use crate::handshake::Binding;

/// How a device reaches the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    /// Tunnel opened by the device itself
    Direct,
    /// Tunnel carried through a relay agent
    Relay,
    /// Local management channel
    Local,
}

impl ConnectionKind {
    /// Decode the value carried by a `connType` control message
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Direct),
            1 => Some(Self::Relay),
            2 => Some(Self::Local),
            _ => None,
        }
    }

    /// Routing preference, lower wins
    fn rank(self) -> u8 {
        match self {
            Self::Direct => 0,
            Self::Relay => 1,
            Self::Local => 2,
        }
    }
}

#[derive(Clone)]
struct Entry {
    conn_id: u64,
    kind: ConnectionKind,
    group_key: String,
    handle: ConnectionHandle,
    /// Counted as part of an announced presence
    announced: bool,
}

/// Live connections per device key
pub struct ConnectionRegistry {
    devices: DashMap<String, Vec<Entry>>,
    events: Arc<dyn EventBus>,
    publish_delay: Duration,
}

impl ConnectionRegistry {
    pub fn new(events: Arc<dyn EventBus>, publish_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            devices: DashMap::new(),
            events,
            publish_delay,
        })
    }

    /// Record an authenticated connection and schedule its announcement
    pub fn register(self: &Arc<Self>, binding: &Binding, handle: ConnectionHandle) {
        let conn_id = handle.id();
        let kind = handle.kind();
        let device_key = binding.device_key.clone();
        let group_key = binding.group_key.clone();

        self.devices
            .entry(device_key.clone())
            .or_default()
            .push(Entry {
                conn_id,
                kind,
                group_key: group_key.clone(),
                handle,
                announced: false,
            });
        debug!(conn = conn_id, "Registered {:?} connection for {}", kind, device_key);

        let registry = Arc::clone(self);
        let delay = self.publish_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !registry.announce(&device_key, conn_id) {
                return;
            }
            registry.events.publish(
                &group_key,
                DirectoryEvent::Connectivity {
                    device_id: device_key,
                    group_id: group_key.clone(),
                    kind,
                    connected: true,
                },
            );
        });
    }

    /// Mark a connection announced. Returns whether it is the first
    /// announced connection of its kind for the device.
    fn announce(&self, device_key: &str, conn_id: u64) -> bool {
        let Some(mut entries) = self.devices.get_mut(device_key) else {
            trace!(conn = conn_id, "Connection gone before announcement");
            return false;
        };
        let Some(pos) = entries.iter().position(|e| e.conn_id == conn_id) else {
            trace!(conn = conn_id, "Connection gone before announcement");
            return false;
        };

        let kind = entries[pos].kind;
        let already_present = entries
            .iter()
            .any(|e| e.conn_id != conn_id && e.kind == kind && e.announced);
        entries[pos].announced = true;
        if already_present {
            trace!(conn = conn_id, "{:?} presence already announced", kind);
        }
        !already_present
    }

    /// Remove a connection. Disconnection is announced once no announced
    /// connection of the same kind remains for the device; a connection that
    /// was never announced goes away silently.
    pub fn unregister(&self, device_key: &str, conn_id: u64) {
        let mut removed = None;
        let mut same_kind_left = false;

        if let Some(mut entries) = self.devices.get_mut(device_key) {
            if let Some(pos) = entries.iter().position(|e| e.conn_id == conn_id) {
                let entry = entries.remove(pos);
                same_kind_left = entries
                    .iter()
                    .any(|e| e.kind == entry.kind && e.announced);
                removed = Some(entry);
            }
        }
        self.devices.remove_if(device_key, |_, entries| entries.is_empty());

        let Some(entry) = removed else {
            return;
        };
        debug!(conn = conn_id, "Unregistered {:?} connection for {}", entry.kind, device_key);

        if entry.announced && !same_kind_left {
            self.events.publish(
                &entry.group_key,
                DirectoryEvent::Connectivity {
                    device_id: device_key.to_string(),
                    group_id: entry.group_key.clone(),
                    kind: entry.kind,
                    connected: false,
                },
            );
        }
    }

    pub fn contains(&self, device_key: &str, conn_id: u64) -> bool {
        self.devices
            .get(device_key)
            .is_some_and(|entries| entries.iter().any(|e| e.conn_id == conn_id))
    }

    /// Handles of every live connection for a device
    pub fn connections(&self, device_key: &str) -> Vec<ConnectionHandle> {
        self.devices
            .get(device_key)
            .map(|entries| entries.iter().map(|e| e.handle.clone()).collect())
            .unwrap_or_default()
    }

    /// A connection for the device that has `port` bound, preferring
    /// direct tunnels over relayed and local ones
    pub fn find_route(&self, device_key: &str, port: u32) -> Option<ConnectionHandle> {
        // Clone first so no map shard is held while locking sessions
        self.connections(device_key)
            .into_iter()
            .filter(|handle| handle.bound_ports().contains(&port))
            .min_by_key(|handle| handle.kind().rank())
    }

    /// Number of devices with at least one connection
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Number of registered connections
    pub fn count(&self) -> usize {
        self.devices.iter().map(|entry| entry.value().len()).sum()
    }
}
