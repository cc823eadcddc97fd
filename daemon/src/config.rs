//! Daemon configuration

use anyhow::Result;
use mps_engine::{
    EngineConfig, GroupMode, GroupRecord, KeepaliveOptions, MemoryDirectory, group_key,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Daemon configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MpsConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Device authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Channel flow control
    #[serde(default)]
    pub channels: ChannelConfig,

    /// Connection registry
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Keepalive options pushed to devices
    #[serde(default)]
    pub keepalive: KeepaliveConfig,

    /// In-memory directory
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Device groups
    #[serde(default)]
    pub groups: Vec<GroupConfig>,

    /// Monitoring configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl MpsConfig {
    /// Load configuration from file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: MpsConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load another file and merge it over this one
    pub async fn load_merge(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let other = Self::load(path).await?;
        self.merge(other);
        Ok(())
    }

    /// Merge another config into this one (incremental)
    ///
    /// Rules:
    /// - Scalar values: overwrite if the new value differs from default
    /// - Option values: overwrite if Some
    /// - Groups: merge by id
    pub fn merge(&mut self, other: MpsConfig) {
        // Server config
        if other.server.bind != default_bind() {
            self.server.bind = other.server.bind;
        }
        if other.server.ws_bind.is_some() {
            self.server.ws_bind = other.server.ws_bind;
        }
        if other.server.max_connections != default_max_connections() {
            self.server.max_connections = other.server.max_connections;
        }
        if other.server.idle_timeout_secs != default_idle_timeout() {
            self.server.idle_timeout_secs = other.server.idle_timeout_secs;
        }
        if other.server.echo_version {
            self.server.echo_version = true;
        }

        // Auth config
        if !other.auth.domain.is_empty() {
            self.auth.domain = other.auth.domain;
        }
        if other.auth.shared_secret.is_some() {
            self.auth.shared_secret = other.auth.shared_secret;
        }

        if other.channels.window_size != default_window_size() {
            self.channels.window_size = other.channels.window_size;
        }
        if other.registry.publish_delay_ms != default_publish_delay() {
            self.registry.publish_delay_ms = other.registry.publish_delay_ms;
        }

        if other.keepalive.interval_secs.is_some() {
            self.keepalive.interval_secs = other.keepalive.interval_secs;
        }
        if other.keepalive.timeout_secs.is_some() {
            self.keepalive.timeout_secs = other.keepalive.timeout_secs;
        }

        if other.directory.max_devices.is_some() {
            self.directory.max_devices = other.directory.max_devices;
        }

        // Groups: merge by id
        for group in other.groups {
            if let Some(existing) = self.groups.iter_mut().find(|g| g.id == group.id) {
                existing.name = group.name;
                existing.mode = group.mode;
            } else {
                self.groups.push(group);
            }
        }

        // Monitoring
        if other.monitoring.prometheus_bind != default_prometheus_bind() {
            self.monitoring.prometheus_bind = other.monitoring.prometheus_bind;
        }
        if !other.monitoring.prometheus_enabled {
            self.monitoring.prometheus_enabled = false;
        }
    }

    /// Engine settings derived from this file
    pub fn engine_config(&self) -> EngineConfig {
        let keepalive = self.keepalive.interval_secs.map(|interval| KeepaliveOptions {
            interval,
            timeout: self.keepalive.timeout_secs.unwrap_or(interval.saturating_mul(3)),
        });

        EngineConfig {
            domain: self.auth.domain.clone(),
            shared_secret: self.auth.shared_secret.clone(),
            window_size: self.channels.window_size,
            idle_timeout: Duration::from_secs(self.server.idle_timeout_secs),
            publish_delay: Duration::from_millis(self.registry.publish_delay_ms),
            keepalive,
            echo_version: self.server.echo_version,
        }
    }

    /// Directory seeded with the configured groups
    pub fn build_directory(&self) -> MemoryDirectory {
        let directory = MemoryDirectory::new(self.directory.max_devices);
        for group in &self.groups {
            directory.add_group(GroupRecord {
                id: group_key(&self.auth.domain, &group.id),
                domain: self.auth.domain.clone(),
                name: group.name.clone(),
                mode: group.mode,
            });
        }
        directory
    }
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// TCP bind address
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    /// WebSocket bind address, disabled when absent
    #[serde(default)]
    pub ws_bind: Option<SocketAddr>,

    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Seconds without inbound bytes before a connection is dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Answer PROTOCOLVERSION with our own version
    #[serde(default)]
    pub echo_version: bool,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 4433))
}

fn default_max_connections() -> usize {
    10000
}

fn default_idle_timeout() -> u64 {
    90
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ws_bind: None,
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout(),
            echo_version: false,
        }
    }
}

/// Device authentication
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthConfig {
    /// Directory domain
    #[serde(default)]
    pub domain: String,

    /// Password every device must present
    #[serde(default)]
    pub shared_secret: Option<String>,
}

/// Channel flow control
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    /// Receive window advertised on channels we open
    #[serde(default = "default_window_size")]
    pub window_size: u32,
}

fn default_window_size() -> u32 {
    mps_engine::DEFAULT_WINDOW_SIZE
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
        }
    }
}

/// Connection registry
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// Delay before a new connection is announced
    #[serde(default = "default_publish_delay")]
    pub publish_delay_ms: u64,
}

fn default_publish_delay() -> u64 {
    400
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            publish_delay_ms: default_publish_delay(),
        }
    }
}

/// Keepalive options; nothing is sent unless `interval_secs` is set
#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeepaliveConfig {
    #[serde(default)]
    pub interval_secs: Option<u32>,

    /// Defaults to three intervals
    #[serde(default)]
    pub timeout_secs: Option<u32>,
}

/// In-memory directory
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DirectoryConfig {
    /// Device limit per domain
    #[serde(default)]
    pub max_devices: Option<usize>,
}

/// Device group
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// Group id; device usernames are its first 16 characters
    pub id: String,

    #[serde(default)]
    pub name: String,

    pub mode: GroupMode,
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Prometheus metrics bind address
    #[serde(default = "default_prometheus_bind")]
    pub prometheus_bind: SocketAddr,

    /// Enable Prometheus
    #[serde(default = "default_true")]
    pub prometheus_enabled: bool,
}

fn default_prometheus_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 9090))
}

fn default_true() -> bool {
    true
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_bind: default_prometheus_bind(),
            prometheus_enabled: default_true(),
        }
    }
}
