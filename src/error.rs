//! # Error Types
//!
//! Custom error types for the telemetry uplink using `thiserror`.

use thiserror::Error;

/// Line protocol encoding errors
///
/// Every encoder call that returns one of these leaves its buffer untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Appending would exceed the buffer capacity
    #[error("record would exceed capacity ({needed} > {capacity} bytes)")]
    Capacity { needed: usize, capacity: usize },

    /// Element appended out of order (e.g. a tag after a field)
    #[error("out of order: {0}")]
    OutOfOrder(&'static str),

    /// Key or value contains a separator character or is empty
    #[error("invalid token {0:?}")]
    InvalidToken(String),

    /// Tag or field key already present in the record
    #[error("duplicate key {0:?}")]
    DuplicateKey(String),

    /// NaN or infinite numeric field value
    #[error("non-finite value for field {0:?}")]
    NonFinite(String),
}

/// Main error type for the telemetry uplink
#[derive(Debug, Error)]
pub enum UplinkError {
    /// Record could not be encoded
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodeError),

    /// Network or HTTP failure during a send
    #[error("Transport error: {0}")]
    Transport(String),

    /// Batch could not be compressed or its buffer could not be allocated
    #[error("Compression error: {0}")]
    Compression(String),

    /// Durable store or report file access failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Calibration sub-protocol aborted
    #[error("Calibration error: {0}")]
    Calibration(String),
}

/// Result type alias for the telemetry uplink
pub type Result<T> = std::result::Result<T, UplinkError>;
