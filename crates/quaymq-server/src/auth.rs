//! Credential store and CONNECT authentication.
//!
//! Passwords are kept either in plaintext (development) or as argon2 hashes
//! in PHC string format, e.g. `$argon2id$v=19$m=19456,t=2,p=1$...`.

use ahash::AHashMap;
use argon2::{Argon2, PasswordHash, PasswordVerifier};
use log::warn;
use parking_lot::RwLock;

use crate::config::{AuthConfig, ConfigError};

/// Result of an authentication check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthResult {
    Allow,
    /// Username known but the password does not match, or unknown username
    /// with anonymous access disabled.
    DenyBadCredentials,
    /// No credentials supplied and anonymous access disabled.
    DenyNotAuthorized,
}

impl AuthResult {
    #[inline]
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthResult::Allow)
    }
}

/// Credentials presented in CONNECT.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub client_id: &'a str,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
}

/// Decides whether a CONNECT may proceed.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, ctx: &AuthContext<'_>) -> AuthResult;
}

enum Secret {
    Plain(String),
    /// Argon2 PHC string, checked parseable on insert.
    Argon2(String),
}

impl Secret {
    fn verify(&self, password: &[u8]) -> bool {
        match self {
            Secret::Plain(stored) => stored.as_bytes() == password,
            Secret::Argon2(phc) => match PasswordHash::new(phc) {
                Ok(hash) => Argon2::default().verify_password(password, &hash).is_ok(),
                Err(_) => false,
            },
        }
    }
}

/// Username to password mapping consulted on every CONNECT.
pub struct CredentialStore {
    users: RwLock<AHashMap<String, Secret>>,
    allow_anonymous: bool,
}

impl CredentialStore {
    pub fn new(allow_anonymous: bool) -> Self {
        Self {
            users: RwLock::new(AHashMap::new()),
            allow_anonymous,
        }
    }

    /// Build the store from the `[auth]` section: `users` entries first, then
    /// the `credentials` list.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        let store = Self::new(config.allow_anonymous);
        for user in &config.users {
            match (&user.password_hash, &user.password) {
                (Some(hash), _) => store.add_hashed(&user.username, hash)?,
                (None, Some(password)) => store.add(&user.username, password),
                (None, None) => {
                    return Err(ConfigError::Validation(format!(
                        "user '{}' has neither password nor password_hash",
                        user.username
                    )))
                }
            }
        }
        for (username, password) in config.parsed_credentials()? {
            store.add(&username, &password);
        }
        Ok(store)
    }

    /// Add or replace a plaintext credential.
    pub fn add(&self, username: &str, password: &str) {
        self.users
            .write()
            .insert(username.to_string(), Secret::Plain(password.to_string()));
    }

    /// Add or replace an argon2 credential.
    pub fn add_hashed(&self, username: &str, phc: &str) -> Result<(), ConfigError> {
        PasswordHash::new(phc).map_err(|e| {
            ConfigError::Validation(format!("invalid argon2 hash for user '{}': {}", username, e))
        })?;
        self.users
            .write()
            .insert(username.to_string(), Secret::Argon2(phc.to_string()));
        Ok(())
    }

    pub fn allow_anonymous(&self) -> bool {
        self.allow_anonymous
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.read().is_empty()
    }
}

impl Authenticator for CredentialStore {
    fn authenticate(&self, ctx: &AuthContext<'_>) -> AuthResult {
        let anonymous = self.allow_anonymous();

        let Some(username) = ctx.username else {
            return if anonymous {
                AuthResult::Allow
            } else {
                AuthResult::DenyNotAuthorized
            };
        };

        let users = self.users.read();
        match users.get(username) {
            Some(secret) => {
                let password = ctx.password.unwrap_or_default();
                if secret.verify(password) {
                    AuthResult::Allow
                } else {
                    warn!("Bad password for user '{}' (client {})", username, ctx.client_id);
                    AuthResult::DenyBadCredentials
                }
            }
            None if anonymous => AuthResult::Allow,
            None => AuthResult::DenyBadCredentials,
        }
    }
}

#[cfg(test)]
mod tests {
    use argon2::password_hash::SaltString;
    use argon2::PasswordHasher;

    use super::*;
    use crate::config::UserConfig;

    fn ctx<'a>(username: Option<&'a str>, password: Option<&'a [u8]>) -> AuthContext<'a> {
        AuthContext {
            client_id: "client1",
            username,
            password,
        }
    }

    #[test]
    fn test_valid_and_invalid_password() {
        let store = CredentialStore::new(false);
        store.add("admin", "secret");

        assert_eq!(store.authenticate(&ctx(Some("admin"), Some(b"secret"))), AuthResult::Allow);
        assert_eq!(
            store.authenticate(&ctx(Some("admin"), Some(b"wrong"))),
            AuthResult::DenyBadCredentials
        );
        assert_eq!(
            store.authenticate(&ctx(Some("admin"), None)),
            AuthResult::DenyBadCredentials
        );
    }

    #[test]
    fn test_anonymous_policy() {
        let closed = CredentialStore::new(false);
        assert_eq!(closed.authenticate(&ctx(None, None)), AuthResult::DenyNotAuthorized);
        assert_eq!(
            closed.authenticate(&ctx(Some("nobody"), Some(b"x"))),
            AuthResult::DenyBadCredentials
        );

        let open = CredentialStore::new(true);
        open.add("admin", "secret");
        assert!(open.authenticate(&ctx(None, None)).is_allowed());
        assert!(open.authenticate(&ctx(Some("nobody"), None)).is_allowed());
        // a known user still needs the right password
        assert!(!open.authenticate(&ctx(Some("admin"), Some(b"nope"))).is_allowed());
    }

    #[test]
    fn test_argon2_credentials() {
        let salt = SaltString::from_b64("c29tZXNhbHQ").unwrap();
        let phc = Argon2::default()
            .hash_password(b"hunter2", &salt)
            .unwrap()
            .to_string();

        let store = CredentialStore::new(false);
        store.add_hashed("bob", &phc).unwrap();
        assert!(store.authenticate(&ctx(Some("bob"), Some(b"hunter2"))).is_allowed());
        assert!(!store.authenticate(&ctx(Some("bob"), Some(b"hunter3"))).is_allowed());

        assert!(store.add_hashed("eve", "not-a-hash").is_err());
    }

    #[test]
    fn test_from_config() {
        let config = AuthConfig {
            allow_anonymous: false,
            users: vec![UserConfig {
                username: "cfg".into(),
                password: Some("pw".into()),
                password_hash: None,
            }],
            credentials: "user1:pass1,user2:pass2".into(),
        };
        let store = CredentialStore::from_config(&config).unwrap();
        assert_eq!(store.len(), 3);
        assert!(store.authenticate(&ctx(Some("user2"), Some(b"pass2"))).is_allowed());
        assert!(store.authenticate(&ctx(Some("cfg"), Some(b"pw"))).is_allowed());
    }
}
