//! Reconciliation pipeline for postindex.
//!
//! This crate turns each store's event stream into hashtag, author and date
//! index entries, tracking progress with per-index checkpoints.
//!
//! ## Key Components
//!
//! - [`evaluate`]: ordered filter rules to a [`Disposition`]
//! - [`run_guarded`]: bounded, backed-off resolution of `Retry` policies
//! - [`project`] / [`fold`]: events to idempotent [`IndexMutation`]s
//! - [`CheckpointStore`]: atomic mutation + checkpoint commits
//! - [`EventSource`]: position-ordered event streams
//! - [`ReconciliationEngine`]: the per-store fetch/evaluate/project/commit loop
//!
//! ## Architecture
//!
//! 1. Load every configured index's checkpoint
//! 2. Fetch events after the lowest checkpoint
//! 3. Evaluate policies once per event
//! 4. Project admitted events into each index that has not seen them
//! 5. Commit all indexes' mutations and checkpoints in one transaction
//! 6. Repeat until the source is drained
//!
//! [`IndexMutation`]: postindex_types::IndexMutation

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod policy;
pub mod projector;
pub mod retry;
pub mod source;

pub use checkpoint::{CheckpointError, CheckpointStore};
pub use engine::{EngineConfig, ReconcileReport, ReconciliationEngine, RunOutcome};
pub use error::IndexingError;
pub use policy::{
    evaluate, run_guarded, Disposition, EventGuard, GuardError, GuardOutcome, ProjectionGuard,
};
pub use projector::{fold, index_keys, project, project_index};
pub use source::{EventSource, LocalEventSource, MemoryEventSource, SourceError};
