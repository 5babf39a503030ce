//! Error types for the discovery subsystem.

use std::io::Error as IoError;
use std::net::AddrParseError;
use thiserror::Error;

/// Error type for discovery operations.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Address parsing error.
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    /// Message or record (de)serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Storage backend error.
    #[error("RocksDB error: {0}")]
    Storage(#[from] rocksdb::Error),

    /// Invalid URL format.
    #[error("Invalid tosnode URL: {0}")]
    InvalidUrl(String),

    /// Local identity could not be derived.
    #[error("Invalid node identity: {0}")]
    InvalidIdentity(String),

    /// Message has expired.
    #[error("Message expired: expiration {0} is outside the accepted window (now {1})")]
    MessageExpired(u64, u64),

    /// Invalid packet size.
    #[error("Invalid packet size: expected at least {0} bytes, got {1}")]
    InvalidPacketSize(usize, usize),

    /// Packet too large.
    #[error("Packet too large: {0} bytes exceeds maximum {1}")]
    PacketTooLarge(usize, usize),

    /// Signature verification failed.
    #[error("Signature verification failed")]
    InvalidSignature,

    /// Socket bind error.
    #[error("Failed to bind UDP socket on {0}: {1}")]
    BindFailed(String, IoError),

    /// The node table was initialized twice.
    #[error("Node table is already initialized")]
    TableAlreadyInitialized,

    /// The node table was used before being initialized.
    #[error("Node table is not initialized")]
    TableNotInitialized,

    /// The outbound message sender was set twice.
    #[error("Message sender is already set")]
    MsgSenderAlreadySet,

    /// No outbound message sender is available yet.
    #[error("Message sender is not set")]
    MsgSenderNotSet,

    /// The orchestrator was started twice or used in the wrong phase.
    #[error("Invalid discovery state: {0}")]
    InvalidState(String),

    /// Self-referential operation (e.g., pinging ourselves).
    #[error("Cannot perform operation on self")]
    SelfOperation,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
