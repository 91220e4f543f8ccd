//! Error types for the Slidewarden crate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for Slidewarden operations.
#[derive(Error, Debug)]
pub enum WardenError {
    /// Configuration file or environment errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Window, limit or block duration out of range. Rejected before any store access.
    #[error("Invalid limiter configuration: {0}")]
    InvalidConfiguration(String),

    /// The shared store could not be reached, timed out, or stayed contended
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// A stored value could not be parsed as a window record
    #[error("Corrupt window record: {reason}")]
    StoreCorruptState { reason: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Slidewarden operations.
pub type Result<T> = std::result::Result<T, WardenError>;
