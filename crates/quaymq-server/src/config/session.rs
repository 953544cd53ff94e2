//! Session configuration.

use serde::Deserialize;

/// Session configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keep `clean_session = false` sessions across disconnects. When off,
    /// every session is treated as clean.
    #[serde(default = "default_persistent")]
    pub persistent: bool,

    /// Keep alive in seconds applied when a client sends 0 (0 = no idle timeout).
    pub default_keep_alive: u16,

    /// Seconds a stored session waits for its client before it is
    /// discarded (0 = forever).
    pub offline_expiry_secs: u64,
}

fn default_persistent() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            default_keep_alive: 0,
            offline_expiry_secs: 0,
        }
    }
}
