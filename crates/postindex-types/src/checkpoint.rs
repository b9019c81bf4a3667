//! Checkpoint records for indexing progress.
//!
//! One checkpoint exists per (store, index) pair and tracks the last event
//! position whose index mutations are durably committed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::{Position, PositionScheme};
use crate::index::{IndexMutation, IndexName};
use crate::validated::StoreName;

/// Current checkpoint schema version. Bumped on schema-affecting changes.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Durable marker of how far an index has processed a store's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexCheckpoint {
    pub store: StoreName,

    pub index: IndexName,

    /// Schema version, monotonically non-decreasing
    pub version: u32,

    /// Last durably applied event position
    pub last_position: Position,

    /// Addressing scheme `last_position` belongs to
    pub scheme: PositionScheme,

    /// Cumulative admitted events
    pub event_count: u64,

    pub updated_at: DateTime<Utc>,
}

impl IndexCheckpoint {
    /// Zero-value checkpoint used when none has been persisted.
    pub fn new(store: StoreName, index: IndexName) -> Self {
        Self {
            store,
            index,
            version: CHECKPOINT_VERSION,
            last_position: Position::ZERO,
            scheme: PositionScheme::default(),
            event_count: 0,
            updated_at: Utc::now(),
        }
    }

    /// Whether anything has ever been committed against this checkpoint.
    pub fn is_fresh(&self) -> bool {
        self.last_position == Position::ZERO && self.event_count == 0
    }

    /// The checkpoint that follows this one after committing a batch.
    pub fn advanced(&self, position: Position, scheme: PositionScheme, admitted: u64) -> Self {
        Self {
            store: self.store.clone(),
            index: self.index,
            version: self.version.max(CHECKPOINT_VERSION),
            last_position: position,
            scheme,
            event_count: self.event_count + admitted,
            updated_at: Utc::now(),
        }
    }
}

/// Mutations for one index plus the checkpoint that covers them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexCommit {
    pub checkpoint: IndexCheckpoint,
    pub mutations: Vec<IndexMutation>,
}

impl IndexCommit {
    pub fn new(checkpoint: IndexCheckpoint, mutations: Vec<IndexMutation>) -> Self {
        Self {
            checkpoint,
            mutations,
        }
    }

    pub fn index(&self) -> IndexName {
        self.checkpoint.index
    }
}
