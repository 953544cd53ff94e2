//! Delivery retry configuration.

use std::time::Duration;

use serde::Deserialize;

/// Default acknowledgement timeout in seconds.
pub const DEFAULT_ACK_TIMEOUT_SECS: u64 = 15;

/// QoS 1/2 retry configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QosConfig {
    /// Seconds to wait for PUBACK/PUBREC/PUBCOMP before retransmitting.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Retransmissions per message before the client is disconnected
    /// (0 = retry until the connection itself dies).
    pub max_retries: u32,
}

fn default_ack_timeout_secs() -> u64 {
    DEFAULT_ACK_TIMEOUT_SECS
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            ack_timeout_secs: DEFAULT_ACK_TIMEOUT_SECS,
            max_retries: 0,
        }
    }
}

impl QosConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.ack_timeout_secs == 0 {
            return Err("qos.ack_timeout_secs must be at least 1".into());
        }
        Ok(())
    }
}
