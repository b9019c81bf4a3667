//! # postindex-types
//!
//! Shared domain types for the postindex system.
//!
//! This crate defines the records that flow between the event log, the
//! reconciliation engine and the store catalog:
//! - Events: immutable, position-ordered post changes
//! - Index entries and mutations: projection targets
//! - Checkpoints: durable per-(store, index) progress markers
//! - Filter rules: ordered include/exclude/retry policies
//! - Stores: catalog entries and their configuration
//! - Settings: layered application configuration
//! - Error envelope: structured failures for agent/CLI consumers
//!
//! All refined strings (handles, URIs, hashtags, store names) are validated
//! when constructed or deserialized.

pub mod checkpoint;
pub mod config;
pub mod envelope;
pub mod error;
pub mod event;
pub mod index;
pub mod policy;
pub mod store;
pub mod validated;

pub use checkpoint::{IndexCheckpoint, IndexCommit, CHECKPOINT_VERSION};
pub use config::{EngineSettings, SchedulerSettings, Settings};
pub use envelope::{ErrorEnvelope, ErrorKind};
pub use error::{TypesError, ValidationError};
pub use event::{EventKind, Position, PositionScheme, PostEvent, PostPayload};
pub use index::{IndexMutation, IndexName, PostIndexEntry};
pub use policy::{parse_date, EventPredicate, FilterErrorPolicy, FilterRule, RetryPolicy};
pub use store::{FormatFlags, Store, StoreConfig, SyncPolicy};
pub use validated::{Handle, Hashtag, PostUri, StoreName};
