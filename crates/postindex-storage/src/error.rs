//! Storage layer error types.

use postindex_types::{IndexName, Position, StoreName, ValidationError};
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// SQLite operation failed
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Key encoding/decoding error
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A stored row failed validation on read
    #[error("Invalid stored value: {0}")]
    Validation(#[from] ValidationError),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Record already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A commit would move a checkpoint backwards
    #[error("Out-of-order checkpoint for {store}/{index}: current {current}, attempted {attempted}")]
    OutOfOrderCheckpoint {
        store: StoreName,
        index: IndexName,
        current: Position,
        attempted: Position,
    },

    /// A schema migration failed
    #[error("Migration {name} failed: {reason}")]
    Migration { name: String, reason: String },

    /// Connection mutex was poisoned by a panicking holder
    #[error("Connection lock poisoned")]
    LockPoisoned,
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}
