//! # postindex-storage
//!
//! Persistence for the post indexer.
//!
//! - [`EventLog`]: RocksDB append-only event log, one per store
//! - [`Database`]: shared SQLite connection with named migrations
//! - [`SqliteStoreCatalog`]: the store registry
//! - [`SqliteIndexStore`]: index entries and checkpoints, committed atomically

pub mod catalog;
pub mod column_families;
pub mod database;
pub mod error;
pub mod event_log;
pub mod index_store;
pub mod keys;
pub mod migrations;

pub use catalog::{SqliteStoreCatalog, StoreCatalog};
pub use database::Database;
pub use error::StorageError;
pub use event_log::EventLog;
pub use index_store::{CommitOutcome, ResetSummary, SqliteIndexStore};
pub use keys::EventKey;
