//! Authentication configuration.

use serde::Deserialize;

use super::ConfigError;

/// Authentication configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Allow clients that present no credentials, or an unknown username.
    pub allow_anonymous: bool,
    /// Static user list.
    pub users: Vec<UserConfig>,
    /// Comma separated `user:pass` pairs, e.g. `alice:a1,bob:b2`.
    pub credentials: String,
}

/// User configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub username: String,
    /// Plaintext password (use password_hash for production).
    #[serde(default)]
    pub password: Option<String>,
    /// Argon2 password hash.
    #[serde(default)]
    pub password_hash: Option<String>,
}

impl AuthConfig {
    /// Split `credentials` into (username, password) pairs.
    pub fn parsed_credentials(&self) -> Result<Vec<(String, String)>, ConfigError> {
        parse_credentials(&self.credentials)
    }
}

/// Parse `user1:pass1,user2:pass2`. Every non-blank entry must contain
/// exactly one `:` and a non-empty username.
pub fn parse_credentials(list: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut pairs = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let mut parts = entry.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(user), Some(pass), None) if !user.is_empty() => {
                pairs.push((user.to_string(), pass.to_string()));
            }
            _ => {
                return Err(ConfigError::Validation(format!(
                    "Credentials could not be parsed: {}",
                    list
                )))
            }
        }
    }
    Ok(pairs)
}
