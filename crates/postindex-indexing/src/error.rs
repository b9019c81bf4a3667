//! Error types for the indexing crate.

use postindex_storage::StorageError;
use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::policy::GuardError;
use crate::source::SourceError;

/// Errors that can occur while reconciling a store
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Checkpoint load/commit issues
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Event source failure
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Guarded policy check failure
    #[error("Guard error: {0}")]
    Guard(#[from] GuardError),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A blocking task panicked or was aborted
    #[error("Blocking task failed: {0}")]
    Join(String),
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for IndexingError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexingError::Join(err.to_string())
    }
}
