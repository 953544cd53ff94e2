//! Error types for the wire codec.

use std::io;

use thiserror::Error;

use crate::packet::PacketType;

/// Main error type for quaymq.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// MQTT protocol errors.
///
/// Every variant is fatal to the connection that produced it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Malformed fixed header: remaining length is not a valid 1-4 byte sequence")]
    MalformedHeader,

    #[error("Truncated packet: need {needed} bytes, have {have}")]
    TruncatedPacket { needed: usize, have: usize },

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Invalid protocol name: expected 'MQTT' or 'MQIsdp', got '{0}'")]
    InvalidProtocolName(String),

    #[error("Invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Packet too large: {size} bytes exceeds maximum {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("Topic too long: {len} bytes exceeds maximum {max}")]
    TopicTooLong { len: usize, max: usize },

    #[error("Topic too deep: {levels} levels exceeds maximum {max}")]
    TopicTooDeep { levels: usize, max: usize },

    #[error("First packet must be CONNECT")]
    FirstPacketNotConnect,

    #[error("Unexpected {0:?} packet")]
    UnexpectedPacket(PacketType),

    #[error("Protocol violation: {0}")]
    Violation(String),
}

pub type Result<T> = std::result::Result<T, Error>;
