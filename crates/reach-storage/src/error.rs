//! Storage error types

use thiserror::Error;

/// Errors from the durable local store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("record not found: {0}")]
    NotFound(String),
}

/// Result alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
