//! Common error types for driftwatch.

use thiserror::Error;

/// Top-level error type for driftwatch operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A detection run could not scan its base directory.
    #[error("Scan error: {0}")]
    Scan(String),

    /// A file could not be digested mid-scan.
    #[error("Digest error: {0}")]
    Digest(String),

    /// The change-set store could not durably persist.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The transport boundary rejected a delivery.
    #[error("Transport error: {0}")]
    Transport(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
