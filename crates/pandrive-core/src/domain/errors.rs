//! Domain error types
//!
//! Errors raised by pure domain logic: chunk planning, range parsing and
//! path handling. Network and provider failures live in `pandrive-api`.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid logical path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Chunk sizing limits are inconsistent (zero, or min above max)
    #[error("Invalid chunk sizing: {0}")]
    InvalidChunkSizing(String),

    /// The file cannot be split within the provider's part-count ceiling
    #[error("File of {size} bytes exceeds the multipart limit of {max} bytes")]
    FileTooLarge {
        /// Size of the file being planned
        size: u64,
        /// Largest size representable with max parts of max part size
        max: u64,
    },

    /// Malformed "start-end" byte range
    #[error("Invalid byte range: {0}")]
    InvalidRange(String),

    /// Invalid state transition attempt
    #[error("Invalid state transition from {from} to {to}")]
    InvalidState {
        /// The current state
        from: String,
        /// The attempted target state
        to: String,
    },

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
