//! quaymq-core - MQTT 3.1.1 packet types and wire codec.
//!
//! This crate provides the packet model and the pure encode/decode functions
//! used by the broker and by test clients.

pub mod error;
pub mod packet;
pub mod varint;

pub use error::{Error, ProtocolError, Result};
pub use packet::*;
