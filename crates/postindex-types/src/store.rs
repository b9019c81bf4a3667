//! Store catalog records and per-store configuration.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TypesError;
use crate::index::IndexName;
use crate::policy::FilterRule;
use crate::validated::StoreName;

/// Output formats a store keeps alongside its indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatFlags {
    #[serde(default = "default_true")]
    pub json: bool,
    #[serde(default)]
    pub markdown: bool,
}

fn default_true() -> bool {
    true
}

impl Default for FormatFlags {
    fn default() -> Self {
        Self {
            json: true,
            markdown: false,
        }
    }
}

/// How a sync run treats existing index state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPolicy {
    /// Resume from the checkpoint and upsert by uri
    #[default]
    Dedupe,
    /// Clear index state and checkpoints, then rebuild from the start
    Refresh,
}

/// Immutable per-store configuration, snapshotted once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreConfig {
    #[serde(default)]
    pub format: FormatFlags,

    #[serde(default)]
    pub auto_sync: bool,

    #[serde(default)]
    pub sync_policy: SyncPolicy,

    /// Ordered filter rules; first match wins
    #[serde(default)]
    pub filters: Vec<FilterRule>,

    /// Indexes maintained for this store
    #[serde(default = "default_indexes")]
    pub indexes: Vec<IndexName>,
}

fn default_indexes() -> Vec<IndexName> {
    IndexName::ALL.to_vec()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            format: FormatFlags::default(),
            auto_sync: false,
            sync_policy: SyncPolicy::default(),
            filters: Vec::new(),
            indexes: default_indexes(),
        }
    }
}

impl StoreConfig {
    pub fn with_filters(mut self, filters: Vec<FilterRule>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    pub fn with_sync_policy(mut self, sync_policy: SyncPolicy) -> Self {
        self.sync_policy = sync_policy;
        self
    }

    pub fn with_indexes(mut self, indexes: Vec<IndexName>) -> Self {
        self.indexes = indexes;
        self
    }

    /// Configured indexes, deduplicated, in canonical order.
    pub fn enabled_indexes(&self) -> Vec<IndexName> {
        IndexName::ALL
            .into_iter()
            .filter(|index| self.indexes.contains(index))
            .collect()
    }

    pub fn to_json(&self) -> Result<String, TypesError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, TypesError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// A catalog entry: one independently configured unit of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Store {
    pub name: StoreName,
    pub root: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub config: StoreConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    /// Directory of the store's event log.
    pub fn events_path(&self) -> PathBuf {
        self.root.join("events")
    }
}
