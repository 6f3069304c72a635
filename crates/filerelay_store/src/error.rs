//! Error types for the store layer.

use thiserror::Error;

/// Store operation result type.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLx error (connection, query, etc.)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (file system operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stream has not been created
    #[error("Stream not found: {0}")]
    StreamNotFound(String),

    /// Stored payload does not describe a valid record
    #[error("Malformed record in stream '{stream}' at sequence {sequence_number}: {reason}")]
    MalformedRecord {
        stream: String,
        sequence_number: i64,
        reason: String,
    },

    /// Invalid argument or state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl StoreError {
    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Whether retrying the same operation later may succeed.
    ///
    /// Busy/locked databases, exhausted pools and I/O failures are transient.
    /// Missing streams and malformed payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Sqlx(err) => match err {
                sqlx::Error::PoolTimedOut
                | sqlx::Error::PoolClosed
                | sqlx::Error::Io(_)
                | sqlx::Error::WorkerCrashed => true,
                sqlx::Error::Database(db_err) => {
                    let message = db_err.message().to_ascii_lowercase();
                    message.contains("locked") || message.contains("busy")
                }
                _ => false,
            },
            StoreError::Io(_) => true,
            StoreError::Serialization(_)
            | StoreError::StreamNotFound(_)
            | StoreError::MalformedRecord { .. }
            | StoreError::InvalidState(_) => false,
        }
    }
}
