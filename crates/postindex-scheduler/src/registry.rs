//! Per-store run history.
//!
//! The `RunRegistry` records when each store last ran, how the run ended
//! and running totals, for the `status` command and scheduled-run logs.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

use postindex_indexing::{ReconcileReport, RunOutcome};
use postindex_types::{ErrorKind, StoreName};

/// How a store's most recent run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LastRun {
    Drained,
    Halted { error: ErrorKind, message: String },
    StoreDisappeared,
    Cancelled,
    /// Another run for the store was still in flight
    Skipped,
    /// The run's task panicked
    Panicked { message: String },
}

impl From<&RunOutcome> for LastRun {
    fn from(outcome: &RunOutcome) -> Self {
        match outcome {
            RunOutcome::Drained => LastRun::Drained,
            RunOutcome::Halted(envelope) => LastRun::Halted {
                error: envelope.error,
                message: envelope.message.clone(),
            },
            RunOutcome::StoreDisappeared => LastRun::StoreDisappeared,
            RunOutcome::Cancelled => LastRun::Cancelled,
        }
    }
}

/// Run history for one store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreRunStatus {
    pub store: StoreName,
    pub last_started: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_result: Option<LastRun>,
    pub run_count: u64,
    pub halt_count: u64,
    pub skip_count: u64,
    /// Events admitted across all recorded runs
    pub admitted_total: u64,
    pub is_running: bool,
}

impl StoreRunStatus {
    pub fn new(store: StoreName) -> Self {
        Self {
            store,
            last_started: None,
            last_duration_ms: None,
            last_result: None,
            run_count: 0,
            halt_count: 0,
            skip_count: 0,
            admitted_total: 0,
            is_running: false,
        }
    }
}

/// Thread-safe run history keyed by store.
#[derive(Debug, Default)]
pub struct RunRegistry {
    stores: RwLock<HashMap<StoreName, StoreRunStatus>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, store: &StoreName, apply: impl FnOnce(&mut StoreRunStatus)) {
        match self.stores.write() {
            Ok(mut stores) => {
                let status = stores
                    .entry(store.clone())
                    .or_insert_with(|| StoreRunStatus::new(store.clone()));
                apply(status);
            }
            Err(_) => warn!(store = %store, "Run registry lock poisoned; status not recorded"),
        }
    }

    pub fn record_start(&self, store: &StoreName) {
        self.update(store, |status| {
            status.is_running = true;
            status.last_started = Some(Utc::now());
        });
    }

    pub fn record_complete(&self, report: &ReconcileReport) {
        self.update(&report.store, |status| {
            status.is_running = false;
            status.last_started = Some(report.started_at);
            status.last_duration_ms = Some(report.duration().as_millis() as u64);
            status.last_result = Some(LastRun::from(&report.outcome));
            status.run_count += 1;
            status.admitted_total += report.admitted;
            if report.is_halted() {
                status.halt_count += 1;
            }
        });
    }

    /// Record a run whose task panicked before producing a report.
    pub fn record_panicked(&self, store: &StoreName, message: &str) {
        self.update(store, |status| {
            status.is_running = false;
            status.run_count += 1;
            status.halt_count += 1;
            status.last_result = Some(LastRun::Panicked {
                message: message.to_string(),
            });
        });
    }

    /// Record that a run was skipped because another was in flight.
    pub fn record_skipped(&self, store: &StoreName) {
        self.update(store, |status| {
            status.skip_count += 1;
            status.last_result = Some(LastRun::Skipped);
        });
    }

    pub fn get_status(&self, store: &StoreName) -> Option<StoreRunStatus> {
        self.stores.read().ok()?.get(store).cloned()
    }

    /// All recorded stores, ordered by name.
    pub fn all_status(&self) -> Vec<StoreRunStatus> {
        let mut all: Vec<StoreRunStatus> = self
            .stores
            .read()
            .map(|stores| stores.values().cloned().collect())
            .unwrap_or_default();
        all.sort_by(|a, b| a.store.cmp(&b.store));
        all
    }

    pub fn forget(&self, store: &StoreName) {
        if let Ok(mut stores) = self.stores.write() {
            stores.remove(store);
        }
    }
}
