//! Error types for the replication pipeline

use filerelay_store::StoreError;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors. Always fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for '{key}': {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Pipeline error type
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Pattern error: {0}")]
    Pattern(String),

    #[error("Key template error: {0}")]
    Template(String),

    #[error("Cursor '{name}' is unreadable: {reason}")]
    CorruptCursor { name: String, reason: String },

    #[error("Task failed: {0}")]
    Task(String),
}

impl RelayError {
    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RelayError::Store(err) => err.is_transient(),
            RelayError::Io(_) => true,
            RelayError::Config(_)
            | RelayError::Pattern(_)
            | RelayError::Template(_)
            | RelayError::CorruptCursor { .. }
            | RelayError::Task(_) => false,
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, RelayError>;
