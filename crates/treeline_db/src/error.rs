//! Error types for the storage layer.

use thiserror::Error;

/// Storage operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Storage errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller broke a storage precondition
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Continuation token could not be decoded
    #[error("Invalid page token: {0}")]
    InvalidPageToken(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbError {
    /// Create a not found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    pub fn invalid_token(msg: impl Into<String>) -> Self {
        Self::InvalidPageToken(msg.into())
    }
}
