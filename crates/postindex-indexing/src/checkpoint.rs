//! Checkpoint persistence contract.
//!
//! A [`CheckpointStore`] commits index mutations together with the checkpoint
//! that covers them. Checkpoints only ever move forward: a commit that would
//! move one backwards is rejected as [`CheckpointError::OutOfOrder`].

use postindex_storage::{SqliteIndexStore, StorageError};
use postindex_types::{IndexCheckpoint, IndexCommit, IndexMutation, IndexName, Position, StoreName};
use thiserror::Error;

/// Errors from checkpoint persistence
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    /// A commit tried to move a checkpoint backwards
    #[error("Out-of-order checkpoint for {store}/{index}: current {current}, attempted {attempted}")]
    OutOfOrder {
        store: StoreName,
        index: IndexName,
        current: Position,
        attempted: Position,
    },

    /// The commit transaction failed; nothing was written
    #[error("Commit failed: {0}")]
    Commit(String),

    /// Reading a checkpoint failed
    #[error("Checkpoint load failed: {0}")]
    Load(String),

    /// A commit targeted a different store than requested
    #[error("Commit for store '{found}' submitted under '{expected}'")]
    StoreMismatch { expected: StoreName, found: StoreName },
}

impl CheckpointError {
    /// Whether retrying the same commit may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckpointError::Commit(_))
    }
}

/// Durable per-(store, index) checkpoints plus the index state they cover.
pub trait CheckpointStore: Send + Sync {
    /// Current checkpoint, or the zero value if none was ever committed.
    fn load(&self, store: &StoreName, index: IndexName) -> Result<IndexCheckpoint, CheckpointError>;

    /// Apply every commit atomically: all of them or none.
    fn commit_batch(&self, store: &StoreName, commits: &[IndexCommit]) -> Result<(), CheckpointError>;

    /// Apply one index's mutations and advance its checkpoint atomically.
    fn commit(
        &self,
        store: &StoreName,
        checkpoint: IndexCheckpoint,
        mutations: Vec<IndexMutation>,
    ) -> Result<(), CheckpointError> {
        self.commit_batch(store, &[IndexCommit::new(checkpoint, mutations)])
    }

    /// Drop all checkpoints and index state of a store and apply `commits`,
    /// atomically. The previous state stays visible if this fails.
    fn rebuild_batch(&self, store: &StoreName, commits: &[IndexCommit]) -> Result<(), CheckpointError>;
}

fn check_store(store: &StoreName, commits: &[IndexCommit]) -> Result<(), CheckpointError> {
    match commits.iter().find(|c| &c.checkpoint.store != store) {
        Some(foreign) => Err(CheckpointError::StoreMismatch {
            expected: store.clone(),
            found: foreign.checkpoint.store.clone(),
        }),
        None => Ok(()),
    }
}

fn commit_error(err: StorageError) -> CheckpointError {
    match err {
        StorageError::OutOfOrderCheckpoint {
            store,
            index,
            current,
            attempted,
        } => CheckpointError::OutOfOrder {
            store,
            index,
            current,
            attempted,
        },
        other => CheckpointError::Commit(other.to_string()),
    }
}

impl CheckpointStore for SqliteIndexStore {
    fn load(&self, store: &StoreName, index: IndexName) -> Result<IndexCheckpoint, CheckpointError> {
        let checkpoint = self
            .load_checkpoint(store, index)
            .map_err(|e| CheckpointError::Load(e.to_string()))?;
        Ok(checkpoint.unwrap_or_else(|| IndexCheckpoint::new(store.clone(), index)))
    }

    fn commit_batch(&self, store: &StoreName, commits: &[IndexCommit]) -> Result<(), CheckpointError> {
        check_store(store, commits)?;
        SqliteIndexStore::commit_batch(self, commits).map_err(commit_error)?;
        Ok(())
    }

    fn rebuild_batch(&self, store: &StoreName, commits: &[IndexCommit]) -> Result<(), CheckpointError> {
        check_store(store, commits)?;
        SqliteIndexStore::rebuild_batch(self, store, commits).map_err(commit_error)?;
        Ok(())
    }
}
