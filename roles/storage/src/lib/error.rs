//! Error handling for the pool's system of record.

use std::fmt;

/// Errors that can occur while reading or writing pool records.
#[derive(Debug)]
pub enum StorageError {
    /// Backend-specific failure (database connection, query, file I/O)
    BackendError(String),
    /// A stored blob could not be encoded or decoded
    SerializationError(String),
    /// Requested record does not exist
    NotFound(String),
    /// Record violates a table constraint (duplicate key, bad enum value)
    InvalidData(String),
    /// Backend was configured with unusable settings
    ConfigError(String),
    /// Backend has not been initialized or was already closed
    BackendUnavailable,
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::BackendError(msg) => write!(f, "Backend error: {}", msg),
            StorageError::SerializationError(msg) => write!(f, "Serialization error: {}", msg),
            StorageError::NotFound(msg) => write!(f, "Not found: {}", msg),
            StorageError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
            StorageError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            StorageError::BackendUnavailable => write!(f, "Storage backend unavailable"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

#[cfg(feature = "sqlite-backend")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => StorageError::BackendUnavailable,
            sqlx::Error::RowNotFound => StorageError::NotFound("row".to_string()),
            other => StorageError::BackendError(other.to_string()),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
