//! Storage error types.
//!
//! - `NotFound`: a write references a local user that does not exist
//! - `Conflict`: a create-only write hit an existing record
//! - `Serialization`: failed to encode/decode a record
//! - `Io`: underlying storage system errors

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Local user record missing
    #[error("local user not found: {device_id}")]
    NotFound {
        /// Device id of the missing user
        device_id: String,
    },

    /// Create-only write hit an existing record
    #[error("record already exists: {device_id}")]
    Conflict {
        /// Device id of the existing user
        device_id: String,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}
