//! Limits configuration.

use serde::Deserialize;

use quaymq_core::varint::MAX_REMAINING_LENGTH;

/// Default maximum packet size (1MB).
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// Default maximum topic length in bytes.
pub const DEFAULT_MAX_TOPIC_LENGTH: usize = 4096;

/// Default maximum topic levels (depth).
pub const DEFAULT_MAX_TOPIC_LEVELS: usize = 32;

/// Default max unacknowledged QoS 1/2 deliveries per client (broker -> client).
pub const DEFAULT_MAX_INFLIGHT: u16 = 50;

/// Default cap on messages held for an offline persistent session.
pub const DEFAULT_MAX_QUEUED_MESSAGES: usize = 1000;

/// Default client write buffer soft limit (1MB).
pub const DEFAULT_CLIENT_WRITE_BUFFER_SIZE: usize = 1024 * 1024;

/// Default maximum connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Limits configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum MQTT packet size in bytes (0 = protocol maximum).
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,

    /// Maximum topic name length in bytes.
    #[serde(default = "default_max_topic_length")]
    pub max_topic_length: usize,

    /// Maximum topic levels (segments separated by '/').
    #[serde(default = "default_max_topic_levels")]
    pub max_topic_levels: usize,

    /// Maximum in-flight QoS 1/2 messages per client; further sends queue.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: u16,

    /// Messages kept for an offline persistent session before the oldest
    /// are dropped (0 = unbounded).
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,

    /// Per-client write buffer soft limit in bytes.
    /// When exceeded, QoS 0 messages are dropped (backpressure).
    #[serde(default = "default_client_write_buffer_size")]
    pub client_write_buffer_size: usize,

    /// Maximum concurrent connections (0 = unbounded).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_max_packet_size() -> u32 {
    DEFAULT_MAX_PACKET_SIZE
}
fn default_max_topic_length() -> usize {
    DEFAULT_MAX_TOPIC_LENGTH
}
fn default_max_topic_levels() -> usize {
    DEFAULT_MAX_TOPIC_LEVELS
}
fn default_max_inflight() -> u16 {
    DEFAULT_MAX_INFLIGHT
}
fn default_max_queued_messages() -> usize {
    DEFAULT_MAX_QUEUED_MESSAGES
}
fn default_client_write_buffer_size() -> usize {
    DEFAULT_CLIENT_WRITE_BUFFER_SIZE
}
fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_topic_length: DEFAULT_MAX_TOPIC_LENGTH,
            max_topic_levels: DEFAULT_MAX_TOPIC_LEVELS,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_queued_messages: DEFAULT_MAX_QUEUED_MESSAGES,
            client_write_buffer_size: DEFAULT_CLIENT_WRITE_BUFFER_SIZE,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl LimitsConfig {
    /// Validate the limits configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_packet_size as usize > MAX_REMAINING_LENGTH + 5 {
            return Err("max_packet_size cannot exceed MQTT protocol maximum (268,435,460)".into());
        }

        if self.max_topic_length > 65535 {
            return Err("max_topic_length cannot exceed 65535".into());
        }

        if self.max_inflight == 0 {
            return Err("max_inflight must be at least 1".into());
        }

        Ok(())
    }

    /// Packet size limit for the decoder, where 0 disables the check.
    pub fn packet_size_limit(&self) -> usize {
        self.max_packet_size as usize
    }
}
