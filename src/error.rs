//! Error types for the replication pipeline

use thiserror::Error;

/// Result type alias for replicator operations
pub type Result<T> = std::result::Result<T, ReplicatorError>;

/// Errors that can occur anywhere between change capture and delivery
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// Envelope bytes could not be parsed (missing field, bad type, bad base64, bad length)
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// A change notification payload could not be parsed
    #[error("Malformed notification: {0}")]
    MalformedNotification(String),

    /// Wrong private key or tampered envelope
    #[error("Decryption failed: {0}")]
    Decryption(String),

    /// No key has been loaded or rotated in yet
    #[error("No active key available for encryption")]
    NoActiveKey,

    /// The key id does not resolve to a loaded key pair
    #[error("Unknown key: {0}")]
    UnknownKey(String),

    /// Only the public half of the key pair is available
    #[error("No private key available for: {0}")]
    NoPrivateKey(String),

    /// Network or HTTP failure while delivering envelopes
    #[error("Delivery error: {0}")]
    Delivery(String),

    /// A component was used before `connect()`
    #[error("Not connected: {0}")]
    NotConnected(&'static str),

    /// Cryptographic operation failed on the encrypting side
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Key rotation error
    #[error("Key rotation error: {0}")]
    KeyRotation(String),

    /// Key storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Source database failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for ReplicatorError {
    fn from(err: serde_json::Error) -> Self {
        ReplicatorError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for ReplicatorError {
    fn from(err: std::io::Error) -> Self {
        ReplicatorError::Storage(err.to_string())
    }
}
