//! Device directory collaborator
//!
//! The engine only needs a handful of operations from the persistent
//! directory: keyed reads and writes of device records, a per-domain quota
//! check, the group list used to resolve usernames, and a lookup of managed
//! devices by hardware identity. `MemoryDirectory` implements them over
//! in-process maps.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Directory unavailable: {0}")]
    Unavailable(String),

    #[error("Record rejected: {0}")]
    Rejected(String),
}

/// How devices in a group are identified and provisioned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    /// Identity derived from the hardware system identifier; unknown devices are created
    Amt,
    /// Devices must already exist as managed endpoints
    Agent,
    #[serde(other)]
    Other,
}

/// A device group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    /// Group key, `mesh/<domain>/<id>`
    pub id: String,
    pub domain: String,
    pub name: String,
    pub mode: GroupMode,
}

/// A device record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device key, `node/<domain>/<id>`
    pub id: String,
    pub group_id: String,
    pub domain: String,
    pub name: String,
    pub system_id: Uuid,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Records stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<DeviceRecord>, DirectoryError>;

    /// Insert or replace a record
    async fn set(&self, record: DeviceRecord) -> Result<(), DirectoryError>;

    /// Whether the domain has reached its device limit
    async fn is_over_quota(&self, domain: &str) -> Result<bool, DirectoryError>;

    /// Groups belonging to a domain
    async fn groups(&self, domain: &str) -> Result<Vec<GroupRecord>, DirectoryError>;

    /// Managed device with the given hardware identity
    async fn find_by_system_id(
        &self,
        domain: &str,
        system_id: &Uuid,
    ) -> Result<Option<DeviceRecord>, DirectoryError>;
}

/// In-memory directory
pub struct MemoryDirectory {
    groups: DashMap<String, GroupRecord>,
    devices: DashMap<String, DeviceRecord>,
    /// Device limit per domain
    max_devices: Option<usize>,
}

impl MemoryDirectory {
    pub fn new(max_devices: Option<usize>) -> Self {
        Self {
            groups: DashMap::new(),
            devices: DashMap::new(),
            max_devices,
        }
    }

    pub fn add_group(&self, group: GroupRecord) {
        self.groups.insert(group.id.clone(), group);
    }

    pub fn add_device(&self, device: DeviceRecord) {
        self.devices.insert(device.id.clone(), device);
    }

    /// Number of devices in a domain
    pub fn device_count(&self, domain: &str) -> usize {
        self.devices
            .iter()
            .filter(|entry| entry.value().domain == domain)
            .count()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get(&self, key: &str) -> Result<Vec<DeviceRecord>, DirectoryError> {
        Ok(self
            .devices
            .get(key)
            .map(|record| vec![record.value().clone()])
            .unwrap_or_default())
    }

    async fn set(&self, record: DeviceRecord) -> Result<(), DirectoryError> {
        if !self.groups.contains_key(&record.group_id) {
            return Err(DirectoryError::Rejected(format!(
                "unknown group {}",
                record.group_id
            )));
        }
        self.add_device(record);
        Ok(())
    }

    async fn is_over_quota(&self, domain: &str) -> Result<bool, DirectoryError> {
        Ok(match self.max_devices {
            Some(max) => self.device_count(domain) >= max,
            None => false,
        })
    }

    async fn groups(&self, domain: &str) -> Result<Vec<GroupRecord>, DirectoryError> {
        let mut groups: Vec<GroupRecord> = self
            .groups
            .iter()
            .filter(|entry| entry.value().domain == domain)
            .map(|entry| entry.value().clone())
            .collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn find_by_system_id(
        &self,
        domain: &str,
        system_id: &Uuid,
    ) -> Result<Option<DeviceRecord>, DirectoryError> {
        Ok(self
            .devices
            .iter()
            .find(|entry| entry.value().domain == domain && entry.value().system_id == *system_id)
            .map(|entry| entry.value().clone()))
    }
}
