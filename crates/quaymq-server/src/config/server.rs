//! Listener configuration.

use std::net::SocketAddr;

use serde::Deserialize;

/// Default MQTT port.
pub const DEFAULT_PORT: u16 = 1883;

/// Default seconds a new connection has to send CONNECT.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default shutdown grace period in milliseconds.
pub const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 15_000;

/// Server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address.
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// Seconds to wait for CONNECT before dropping the socket (0 = wait forever).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// How long `stop` lets connections drain before forcing them closed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))
}

fn default_connect_timeout_secs() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            shutdown_grace_ms: DEFAULT_SHUTDOWN_GRACE_MS,
        }
    }
}
