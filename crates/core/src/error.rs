//! Error types for the preferences store
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Every variant is `Clone`: a decode failure is cached next to the row that
//! produced it and handed out again on each read that touches that row.

use crate::codec::CodecError;
use thiserror::Error;

/// Result type alias for preferences operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the preferences store
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// Operation invoked on a facade that has not been initialized
    #[error("Preferences are not initialized")]
    NotInitialized,

    /// A stored row's type/value pair cannot be decoded
    #[error("Corrupt value for key '{key}': {reason}")]
    CorruptValue {
        /// Key of the corrupt row
        key: String,
        /// What made the row undecodable
        reason: String,
    },

    /// A typed read requested a type different from the stored one
    #[error("Type mismatch for key '{key}': expected {expected}, found {actual}")]
    TypeMismatch {
        /// Key that was read
        key: String,
        /// Type requested by the caller
        expected: &'static str,
        /// Type stored for the key
        actual: &'static str,
    },

    /// An opaque value could not be serialized
    #[error("Cannot encode value for key '{key}': {reason}")]
    Encode {
        /// Key being written
        key: String,
        /// Serializer message
        reason: String,
    },

    /// The backing store rejected or failed a request
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Waiting for the store was cut short
    #[error("Interrupted: {0}")]
    Interrupted(String),

    /// Too many operations between two yield points
    #[error("Too many operations between yield points: {operations}")]
    MalformedBatch {
        /// Number of operations seen since the last yield point
        operations: usize,
    },

    /// A requested yield point failed mid-batch
    #[error("Yield failed: {0}")]
    YieldFailed(String),

    /// Invalid argument (empty key and the like)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build a persistence error from any displayable cause
    pub fn persistence(msg: impl Into<String>) -> Self {
        Error::Persistence(msg.into())
    }

    /// Build an invalid-input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// True for errors that only concern the read that raised them
    pub fn is_read_local(&self) -> bool {
        matches!(self, Error::CorruptValue { .. } | Error::TypeMismatch { .. })
    }
}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Corrupt { key, reason } => Error::CorruptValue { key, reason },
            CodecError::Encode { key, reason } => Error::Encode { key, reason },
        }
    }
}
