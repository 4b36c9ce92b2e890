//! Storage error taxonomy

use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-related errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("record not found: {0}")]
    NotFound(String),

    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failure: {0}")]
    Serialization(String),

    #[error("record schema version {found} is incompatible with {expected}")]
    SchemaMismatch { expected: u32, found: u32 },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
