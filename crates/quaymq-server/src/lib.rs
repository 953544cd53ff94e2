//! quaymq broker: sessions, routing and QoS delivery on top of the
//! `quaymq-core` codec.

pub mod auth;
pub mod broker;
pub mod config;
pub mod connection;
pub mod packet_id;
pub mod qos;
pub mod router;
pub mod session;
pub mod subscription;
pub mod util;
pub mod will;
pub mod write_buffer;

pub use auth::{AuthResult, Authenticator, CredentialStore};
pub use broker::Broker;
pub use config::{Config, ConfigError};
pub use qos::{QosEngine, QosError, QosSettings};
pub use router::TopicRouter;
pub use session::{AuthError, SessionRegistry};
