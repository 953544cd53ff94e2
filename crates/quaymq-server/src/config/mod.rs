//! Broker configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `quaymq.toml`)
//! - Environment variables with `QUAYMQ__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `QUAYMQ__SERVER__BIND=0.0.0.0:1884`
//! - `QUAYMQ__QOS__ACK_TIMEOUT_SECS=30`
//! - `QUAYMQ__AUTH__CREDENTIALS=alice:a1,bob:b2`
//!
//! In-file substitution examples:
//! ```toml
//! [server]
//! bind = "${MQTT_HOST:-0.0.0.0}:${MQTT_PORT:-1883}"
//! ```

mod auth;
mod limits;
mod log;
mod qos;
mod server;
mod session;

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use auth::{parse_credentials, AuthConfig, UserConfig};
pub use limits::{
    LimitsConfig, DEFAULT_CLIENT_WRITE_BUFFER_SIZE, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_INFLIGHT,
    DEFAULT_MAX_PACKET_SIZE, DEFAULT_MAX_QUEUED_MESSAGES, DEFAULT_MAX_TOPIC_LENGTH,
    DEFAULT_MAX_TOPIC_LEVELS,
};
pub use log::LogConfig;
pub use qos::{QosConfig, DEFAULT_ACK_TIMEOUT_SECS};
pub use server::{
    ServerConfig, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_PORT, DEFAULT_SHUTDOWN_GRACE_MS,
};
pub use session::SessionConfig;

use crate::qos::QosSettings;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(format!("substitution pattern: {}", e)))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub limits: LimitsConfig,
    pub session: SessionConfig,
    pub qos: QosConfig,
    pub auth: AuthConfig,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error; defaults and `QUAYMQ__*` variables
    /// still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("server.bind", format!("0.0.0.0:{}", DEFAULT_PORT))?
            .set_default(
                "server.connect_timeout_secs",
                DEFAULT_CONNECT_TIMEOUT_SECS as i64,
            )?
            .set_default("server.shutdown_grace_ms", DEFAULT_SHUTDOWN_GRACE_MS as i64)?
            .set_default("limits.max_packet_size", DEFAULT_MAX_PACKET_SIZE as i64)?
            .set_default("limits.max_topic_length", DEFAULT_MAX_TOPIC_LENGTH as i64)?
            .set_default("limits.max_topic_levels", DEFAULT_MAX_TOPIC_LEVELS as i64)?
            .set_default("limits.max_inflight", DEFAULT_MAX_INFLIGHT as i64)?
            .set_default(
                "limits.max_queued_messages",
                DEFAULT_MAX_QUEUED_MESSAGES as i64,
            )?
            .set_default(
                "limits.client_write_buffer_size",
                DEFAULT_CLIENT_WRITE_BUFFER_SIZE as i64,
            )?
            .set_default("limits.max_connections", DEFAULT_MAX_CONNECTIONS as i64)?
            .set_default("session.persistent", true)?
            .set_default("session.default_keep_alive", 0)?
            .set_default("session.offline_expiry_secs", 0)?
            .set_default("qos.ack_timeout_secs", DEFAULT_ACK_TIMEOUT_SECS as i64)?
            .set_default("qos.max_retries", 0)?
            .set_default("auth.allow_anonymous", false)?
            .set_default("auth.credentials", "")?;

        let path = path.as_ref();
        if path.is_file() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content)?;
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        // QUAYMQ__SERVER__BIND etc.
        let cfg = builder
            .add_source(
                Environment::with_prefix("QUAYMQ")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content)?;
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration. Runs before anything binds a socket.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.limits.validate().map_err(ConfigError::Validation)?;
        self.qos.validate().map_err(ConfigError::Validation)?;
        self.auth.parsed_credentials()?;
        Ok(())
    }

    /// Settings for each connection's delivery engine.
    pub fn qos_settings(&self) -> QosSettings {
        QosSettings {
            ack_timeout: self.qos.ack_timeout(),
            max_inflight: self.limits.max_inflight as usize,
            max_retries: self.qos.max_retries,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.server.shutdown_grace_ms)
    }

    /// How long stored sessions are kept, if limited.
    pub fn offline_expiry(&self) -> Option<Duration> {
        match self.session.offline_expiry_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Time a fresh connection gets to send CONNECT, if limited.
    pub fn connect_timeout(&self) -> Option<Duration> {
        match self.server.connect_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.bind.port(), 1883);
        assert_eq!(config.limits.max_inflight, 50);
        assert_eq!(config.qos.ack_timeout(), Duration::from_secs(15));
        assert!(!config.auth.allow_anonymous);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:1884"
connect_timeout_secs = 5

[limits]
max_packet_size = 2097152
max_inflight = 10

[session]
persistent = false
offline_expiry_secs = 3600

[qos]
ack_timeout_secs = 3
max_retries = 4

[auth]
allow_anonymous = true
credentials = "user1:pass1"
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.server.bind.port(), 1884);
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.limits.max_packet_size, 2097152);
        assert!(!config.session.persistent);
        assert_eq!(config.offline_expiry(), Some(Duration::from_secs(3600)));

        let settings = config.qos_settings();
        assert_eq!(settings.max_inflight, 10);
        assert_eq!(settings.ack_timeout, Duration::from_secs(3));
        assert_eq!(settings.max_retries, 4);
        assert!(config.auth.allow_anonymous);
    }

    #[test]
    fn test_parse_partial_toml() {
        let toml = r#"
[limits]
max_packet_size = 512000
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.limits.max_packet_size, 512000);
        assert_eq!(config.limits.max_topic_levels, DEFAULT_MAX_TOPIC_LEVELS);
        assert_eq!(config.server.bind.port(), 1883);
        assert_eq!(config.qos.ack_timeout_secs, 15);
        assert_eq!(config.offline_expiry(), None);
    }

    #[test]
    fn test_bad_credentials_rejected_before_start() {
        let toml = r#"
[auth]
credentials = "user1:pass1,garbage"
"#;
        assert!(matches!(Config::parse(toml), Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        std::env::remove_var("QUAYMQ_TEST_UNSET_PORT");
        let content = r#"bind = "0.0.0.0:${QUAYMQ_TEST_UNSET_PORT:-1999}""#;
        let substituted = substitute_env_vars(content).unwrap();
        assert!(substituted.contains("0.0.0.0:1999"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nbind = \"127.0.0.1:18830\"\n[qos]\nack_timeout_secs = 7"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.bind.port(), 18830);
        assert_eq!(config.qos.ack_timeout_secs, 7);
        assert_eq!(config.limits.max_inflight, DEFAULT_MAX_INFLIGHT);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/quaymq.toml").unwrap();
        assert_eq!(config.server.shutdown_grace_ms, DEFAULT_SHUTDOWN_GRACE_MS);
    }
}
