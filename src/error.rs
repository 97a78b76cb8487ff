//! Error taxonomy for the ingestion pipeline.
//!
//! Each stage owns one error type. Parse errors are recovered inside the
//! worker that hit them; connection and storage errors are surfaced as log
//! events and counters; configuration errors are fatal at startup only.

use thiserror::Error;

// ---

/// A message that could not be turned into a valid [`crate::Reading`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Topic does not match `prefix/H-<hub>/S-<sensor>`.
    #[error("bad topic '{0}'")]
    BadTopic(String),

    /// Body is not JSON, or a required field is missing or has the wrong type.
    #[error("malformed payload at '{path}': {reason}")]
    MalformedPayload { path: String, reason: String },

    /// Field decoded fine but its value is not plausible.
    #[error("{field} out of range: {reason}")]
    OutOfRange { field: &'static str, reason: String },
}

/// Failure reported by the Storage Writer.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Storage location could not be prepared.
    #[error("storage path error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be mapped back into the domain model.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Broker link failure. Always transient; the connection manager retries.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("mqtt link error: {0}")]
    Link(#[from] rumqttc::ConnectionError),

    #[error("mqtt request rejected: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Invalid startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set in .env or environment")]
    Missing(&'static str),

    #[error("invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
