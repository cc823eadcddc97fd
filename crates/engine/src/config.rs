//! Engine configuration

use std::time::Duration;

/// Default advertised receive window per channel
pub const DEFAULT_WINDOW_SIZE: u32 = 32768;

/// Keepalive options sent to the device after authentication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveOptions {
    /// Seconds between device keepalive requests
    pub interval: u32,

    /// Seconds without traffic before the device gives up
    pub timeout: u32,
}

/// Runtime configuration shared by every connection
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory domain devices are bound into
    pub domain: String,

    /// Shared password devices must present, if any
    pub shared_secret: Option<String>,

    /// Receive window advertised on channels we open
    pub window_size: u32,

    /// Close connections that send nothing for this long
    pub idle_timeout: Duration,

    /// Delay before announcing a new connection
    pub publish_delay: Duration,

    /// Keepalive options pushed after USERAUTH_SUCCESS
    pub keepalive: Option<KeepaliveOptions>,

    /// Answer PROTOCOLVERSION with our own version frame
    pub echo_version: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            shared_secret: None,
            window_size: DEFAULT_WINDOW_SIZE,
            idle_timeout: Duration::from_secs(90),
            publish_delay: Duration::from_millis(400),
            keepalive: None,
            echo_version: false,
        }
    }
}
