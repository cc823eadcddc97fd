//! Identity binding for authenticating devices
//!
//! Turns a USERAUTH attempt into a directory binding. Read failures from
//! the directory count as "not found"; a failed write while provisioning is
//! returned to the caller.

use mps_protocol::AUTH_METHOD_PASSWORD;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::directory::{DeviceRecord, Directory, DirectoryError, GroupMode, GroupRecord};
use crate::events::{DirectoryEvent, EventBus};
use crate::identity::{USERNAME_LEN, amt_node_id, device_key, match_group};
use crate::metrics::METRICS;
use crate::session::AuthAttempt;

/// A device identity bound to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub device_key: String,
    pub group_key: String,
    pub domain: String,
    pub system_id: Uuid,
}

/// Why authentication failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthRejection {
    #[error("Username must be 16 bytes, got {0}")]
    UsernameLength(usize),

    #[error("Invalid credential")]
    BadCredential,

    #[error("No PROTOCOLVERSION received")]
    MissingSystemId,

    #[error("No group matches the username")]
    UnknownGroup,

    #[error("Device is not provisioned")]
    UnknownDevice,

    #[error("Group does not accept hardware connections")]
    UnsupportedMode,

    #[error("Provisioning failed: {0}")]
    ProvisioningFailed(String),
}

/// Result of an identity lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Bound(Binding),
    Rejected(AuthRejection),
    /// The domain is full; drop the connection without a reply
    OverQuota,
}

/// Resolves USERAUTH attempts against the directory
pub struct IdentityBinder {
    directory: Arc<dyn Directory>,
    events: Arc<dyn EventBus>,
    config: Arc<EngineConfig>,
}

impl IdentityBinder {
    pub fn new(
        directory: Arc<dyn Directory>,
        events: Arc<dyn EventBus>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            directory,
            events,
            config,
        }
    }

    /// Bind an authentication attempt to a device record
    pub async fn bind(&self, attempt: &AuthAttempt) -> Result<AuthOutcome, DirectoryError> {
        let len = attempt.username.len();
        if len != USERNAME_LEN {
            return Ok(AuthOutcome::Rejected(AuthRejection::UsernameLength(len)));
        }

        if let Some(secret) = &self.config.shared_secret {
            let supplied = if attempt.method == AUTH_METHOD_PASSWORD {
                attempt.password.as_deref()
            } else {
                None
            };
            if supplied != Some(secret.as_str()) {
                return Ok(AuthOutcome::Rejected(AuthRejection::BadCredential));
            }
        }

        let Some(system_id) = attempt.system_id else {
            return Ok(AuthOutcome::Rejected(AuthRejection::MissingSystemId));
        };

        let groups = self
            .directory
            .groups(&self.config.domain)
            .await
            .unwrap_or_else(|e| {
                warn!("Group lookup failed: {}", e);
                Vec::new()
            });
        let Some(group) = match_group(&groups, &attempt.username) else {
            debug!("No group for username {}", attempt.username);
            return Ok(AuthOutcome::Rejected(AuthRejection::UnknownGroup));
        };

        match group.mode {
            GroupMode::Amt => self.bind_hardware(group, system_id).await,
            GroupMode::Agent => Ok(self.bind_managed(group, system_id).await),
            GroupMode::Other => Ok(AuthOutcome::Rejected(AuthRejection::UnsupportedMode)),
        }
    }

    /// Device key derived from the system id; unknown devices are created
    async fn bind_hardware(
        &self,
        group: &GroupRecord,
        system_id: Uuid,
    ) -> Result<AuthOutcome, DirectoryError> {
        let key = device_key(&group.domain, &amt_node_id(&system_id));
        let existing = self.directory.get(&key).await.unwrap_or_else(|e| {
            warn!("Device lookup for {} failed: {}", key, e);
            Vec::new()
        });

        if let Some(record) = existing.into_iter().next() {
            return Ok(AuthOutcome::Bound(Binding {
                device_key: record.id,
                group_key: record.group_id,
                domain: record.domain,
                system_id,
            }));
        }

        let over_quota = self
            .directory
            .is_over_quota(&group.domain)
            .await
            .unwrap_or_else(|e| {
                warn!("Quota check for domain '{}' failed: {}", group.domain, e);
                false
            });
        if over_quota {
            return Ok(AuthOutcome::OverQuota);
        }

        let record = DeviceRecord {
            id: key.clone(),
            group_id: group.id.clone(),
            domain: group.domain.clone(),
            name: system_id.to_string(),
            system_id,
        };
        let name = record.name.clone();
        self.directory.set(record).await?;

        METRICS.devices_added.inc();
        info!("Provisioned device {} in group {}", key, group.id);
        self.events.publish(
            &group.id,
            DirectoryEvent::DeviceAdded {
                device_id: key.clone(),
                group_id: group.id.clone(),
                name,
            },
        );

        Ok(AuthOutcome::Bound(Binding {
            device_key: key,
            group_key: group.id.clone(),
            domain: group.domain.clone(),
            system_id,
        }))
    }

    /// Device must already exist; never provisioned here
    async fn bind_managed(&self, group: &GroupRecord, system_id: Uuid) -> AuthOutcome {
        let record = self
            .directory
            .find_by_system_id(&group.domain, &system_id)
            .await
            .unwrap_or_else(|e| {
                warn!("Device lookup for {} failed: {}", system_id, e);
                None
            });

        match record {
            Some(record) => AuthOutcome::Bound(Binding {
                device_key: record.id,
                group_key: record.group_id,
                domain: record.domain,
                system_id,
            }),
            None => AuthOutcome::Rejected(AuthRejection::UnknownDevice),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use crate::events::BroadcastBus;
    use async_trait::async_trait;

    const SYSTEM_ID: Uuid = Uuid::from_u128(0x0011_2233_4455_6677_8899_aabb_ccdd_eeff);
    const USERNAME: &str = "abcdefghijklmnop";

    fn group(mode: GroupMode) -> GroupRecord {
        GroupRecord {
            id: "mesh//abcdefghijklmnopqrstuvwxyz".to_string(),
            domain: String::new(),
            name: "Lab".to_string(),
            mode,
        }
    }

    fn attempt(username: &str, password: Option<&str>) -> AuthAttempt {
        AuthAttempt {
            generation: 1,
            username: username.to_string(),
            method: AUTH_METHOD_PASSWORD.to_string(),
            password: password.map(str::to_string),
            system_id: Some(SYSTEM_ID),
        }
    }

    fn binder(
        directory: Arc<MemoryDirectory>,
        config: EngineConfig,
    ) -> (IdentityBinder, Arc<BroadcastBus>) {
        let bus = Arc::new(BroadcastBus::default());
        let binder = IdentityBinder::new(directory, bus.clone(), Arc::new(config));
        (binder, bus)
    }

    #[tokio::test]
    async fn test_unmatched_username_rejected() {
        let directory = Arc::new(MemoryDirectory::new(None));
        directory.add_group(group(GroupMode::Amt));
        let (binder, _bus) = binder(directory, EngineConfig::default());

        let outcome = binder.bind(&attempt("zzzzzzzzzzzzzzzz", None)).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Rejected(AuthRejection::UnknownGroup));
    }

    #[tokio::test]
    async fn test_username_length_enforced() {
        let directory = Arc::new(MemoryDirectory::new(None));
        directory.add_group(group(GroupMode::Amt));
        let (binder, _bus) = binder(directory, EngineConfig::default());

        let outcome = binder.bind(&attempt("abcdefgh", None)).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Rejected(AuthRejection::UsernameLength(8)));
    }

    #[tokio::test]
    async fn test_username_length_counted_in_bytes() {
        let directory = Arc::new(MemoryDirectory::new(None));
        directory.add_group(group(GroupMode::Amt));
        let (binder, _bus) = binder(directory, EngineConfig::default());

        // Eight two-byte characters fill the 16-byte field
        let outcome = binder.bind(&attempt("éééééééé", None)).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Rejected(AuthRejection::UnknownGroup));

        let outcome = binder.bind(&attempt("ééééééééé", None)).await.unwrap();
        assert_eq!(outcome, AuthOutcome::Rejected(AuthRejection::UsernameLength(18)));
    }

    #[tokio::test]
    async fn test_shared_secret() {
        let directory = Arc::new(MemoryDirectory::new(None));
        directory.add_group(group(GroupMode::Amt));
        let config = EngineConfig {
            shared_secret: Some("hunter2".to_string()),
            ..Default::default()
        };
        let (binder, _bus) = binder(directory, config);

        assert_eq!(
            binder.bind(&attempt(USERNAME, Some("wrong"))).await.unwrap(),
            AuthOutcome::Rejected(AuthRejection::BadCredential)
        );
        assert_eq!(
            binder.bind(&attempt(USERNAME, None)).await.unwrap(),
            AuthOutcome::Rejected(AuthRejection::BadCredential)
        );
        assert!(matches!(
            binder.bind(&attempt(USERNAME, Some("hunter2"))).await.unwrap(),
            AuthOutcome::Bound(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_system_id() {
        let directory = Arc::new(MemoryDirectory::new(None));
        directory.add_group(group(GroupMode::Amt));
        let (binder, _bus) = binder(directory, EngineConfig::default());

        let mut no_version = attempt(USERNAME, None);
        no_version.system_id = None;
        assert_eq!(
            binder.bind(&no_version).await.unwrap(),
            AuthOutcome::Rejected(AuthRejection::MissingSystemId)
        );
    }

    #[tokio::test]
    async fn test_hardware_mode_provisions_once() {
        let directory = Arc::new(MemoryDirectory::new(None));
        directory.add_group(group(GroupMode::Amt));
        let (binder, bus) = binder(directory.clone(), EngineConfig::default());
        let mut events = bus.subscribe();

        let outcome = binder.bind(&attempt(USERNAME, None)).await.unwrap();
        let AuthOutcome::Bound(binding) = outcome else {
            panic!("expected binding, got {:?}", outcome);
        };
        assert_eq!(
            binding.device_key,
            format!("node//{}", amt_node_id(&SYSTEM_ID))
        );
        assert_eq!(binding.group_key, "mesh//abcdefghijklmnopqrstuvwxyz");
        assert_eq!(directory.device_count(""), 1);

        let (scope, event) = events.try_recv().unwrap();
        assert_eq!(scope, binding.group_key);
        assert!(matches!(event, DirectoryEvent::DeviceAdded { .. }));

        // Second connection finds the record and announces nothing
        let again = binder.bind(&attempt(USERNAME, None)).await.unwrap();
        assert_eq!(again, AuthOutcome::Bound(binding));
        assert_eq!(directory.device_count(""), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_hardware_mode_quota() {
        let directory = Arc::new(MemoryDirectory::new(Some(0)));
        directory.add_group(group(GroupMode::Amt));
        let (binder, _bus) = binder(directory.clone(), EngineConfig::default());

        let outcome = binder.bind(&attempt(USERNAME, None)).await.unwrap();
        assert_eq!(outcome, AuthOutcome::OverQuota);
        assert_eq!(directory.device_count(""), 0);
    }

    #[tokio::test]
    async fn test_managed_mode_never_provisions() {
        let directory = Arc::new(MemoryDirectory::new(None));
        directory.add_group(group(GroupMode::Agent));
        let (binder, _bus) = binder(directory.clone(), EngineConfig::default());

        assert_eq!(
            binder.bind(&attempt(USERNAME, None)).await.unwrap(),
            AuthOutcome::Rejected(AuthRejection::UnknownDevice)
        );
        assert_eq!(directory.device_count(""), 0);

        directory.add_device(DeviceRecord {
            id: "node//agent1".to_string(),
            group_id: "mesh//abcdefghijklmnopqrstuvwxyz".to_string(),
            domain: String::new(),
            name: "desk".to_string(),
            system_id: SYSTEM_ID,
        });
        let outcome = binder.bind(&attempt(USERNAME, None)).await.unwrap();
        assert!(matches!(
            outcome,
            AuthOutcome::Bound(Binding { ref device_key, .. }) if device_key == "node//agent1"
        ));
    }

    #[tokio::test]
    async fn test_other_mode_rejected() {
        let directory = Arc::new(MemoryDirectory::new(None));
        directory.add_group(group(GroupMode::Other));
        let (binder, _bus) = binder(directory, EngineConfig::default());

        assert_eq!(
            binder.bind(&attempt(USERNAME, None)).await.unwrap(),
            AuthOutcome::Rejected(AuthRejection::UnsupportedMode)
        );
    }

    /// Directory whose reads fail and whose writes are refused
    struct BrokenDirectory;

    #[async_trait]
    impl Directory for BrokenDirectory {
        async fn get(&self, _key: &str) -> Result<Vec<DeviceRecord>, DirectoryError> {
            Err(DirectoryError::Unavailable("down".to_string()))
        }

        async fn set(&self, _record: DeviceRecord) -> Result<(), DirectoryError> {
            Err(DirectoryError::Unavailable("down".to_string()))
        }

        async fn is_over_quota(&self, _domain: &str) -> Result<bool, DirectoryError> {
            Err(DirectoryError::Unavailable("down".to_string()))
        }

        async fn groups(&self, _domain: &str) -> Result<Vec<GroupRecord>, DirectoryError> {
            Ok(vec![group(GroupMode::Amt)])
        }

        async fn find_by_system_id(
            &self,
            _domain: &str,
            _system_id: &Uuid,
        ) -> Result<Option<DeviceRecord>, DirectoryError> {
            Err(DirectoryError::Unavailable("down".to_string()))
        }
    }

    #[tokio::test]
    async fn test_read_errors_are_not_found_and_write_errors_surface() {
        let bus = Arc::new(BroadcastBus::default());
        let binder = IdentityBinder::new(
            Arc::new(BrokenDirectory),
            bus,
            Arc::new(EngineConfig::default()),
        );

        let result = binder.bind(&attempt(USERNAME, None)).await;
        assert!(matches!(result, Err(DirectoryError::Unavailable(_))));
    }
}
