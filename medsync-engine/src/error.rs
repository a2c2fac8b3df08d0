//! Error types for the sync engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// Upload or download failed. Wraps the collaborator's original error.
    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("A sync cycle is already in progress")]
    SyncInProgress,

    #[error("Sync cycle cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Whether the host can simply try again on the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Cancelled | SyncError::SyncInProgress
        )
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for SyncError {
    fn from(err: config::ConfigError) -> Self {
        SyncError::Configuration(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
