//! Error types for the release sync core.

use std::time::Duration;
use thiserror::Error;

/// Main error type for sync, aggregation and repository operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fetch timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Change feed closed")]
    FeedClosed,

    #[error("Malformed query: {0}")]
    MalformedQuery(String),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Document already exists: {0}")]
    DocumentExists(String),

    #[error("Invalid document: {0}")]
    InvalidDocument(String),

    #[error("Gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: Box<SyncError> },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Already started")]
    AlreadyStarted,
}

impl SyncError {
    /// Whether the failure is worth retrying.
    ///
    /// Timeouts and transport drops are transient; everything else is
    /// terminal for the operation that produced it.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::Timeout(_) | SyncError::Transport(_) | SyncError::FeedClosed
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            SyncError::Deserialization(e.to_string())
        } else {
            SyncError::Serialization(e.to_string())
        }
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}

/// Result type for release sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
