//! Multi-store sync coordination.
//!
//! The [`SyncCoordinator`] reconciles many stores at once. Each store runs in
//! its own tokio task; a semaphore bounds how many run in parallel and the
//! per-store [`StoreGuards`] skip a store whose previous run has not finished.
//! A halted, panicked or vanished store never affects the others.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use postindex_indexing::{ReconcileReport, ReconciliationEngine, RunOutcome};
use postindex_types::{Store, StoreName};

use crate::config::SchedulerConfig;
use crate::overlap::StoreGuards;
use crate::registry::RunRegistry;
use crate::SchedulerError;

/// Result of asking the coordinator to run one store.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StoreRunResult {
    Completed(ReconcileReport),
    /// A run for the store was already in flight
    Skipped { store: StoreName },
    /// The store's task panicked; no checkpoint moved past its last commit
    Panicked { store: StoreName, message: String },
}

impl StoreRunResult {
    pub fn store(&self) -> &StoreName {
        match self {
            StoreRunResult::Completed(report) => &report.store,
            StoreRunResult::Skipped { store } | StoreRunResult::Panicked { store, .. } => store,
        }
    }

    pub fn report(&self) -> Option<&ReconcileReport> {
        match self {
            StoreRunResult::Completed(report) => Some(report),
            _ => None,
        }
    }

    /// Whether the store stopped on an error.
    pub fn is_failure(&self) -> bool {
        match self {
            StoreRunResult::Completed(report) => report.is_halted(),
            StoreRunResult::Skipped { .. } => false,
            StoreRunResult::Panicked { .. } => true,
        }
    }
}

/// Results of one coordinated sync, ordered by store name.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncSummary {
    pub results: Vec<StoreRunResult>,
}

impl SyncSummary {
    pub fn get(&self, store: &StoreName) -> Option<&StoreRunResult> {
        self.results.iter().find(|result| result.store() == store)
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| r.is_failure()).count()
    }

    pub fn has_failures(&self) -> bool {
        self.failures() > 0
    }

    pub fn skipped(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r, StoreRunResult::Skipped { .. }))
            .count()
    }
}

/// Runs the reconciliation engine over many stores with bounded parallelism.
pub struct SyncCoordinator {
    engine: Arc<ReconciliationEngine>,
    guards: Arc<StoreGuards>,
    registry: Arc<RunRegistry>,
    permits: Arc<Semaphore>,
    concurrency: usize,
}

impl SyncCoordinator {
    pub fn new(engine: Arc<ReconciliationEngine>, config: &SchedulerConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            engine,
            guards: Arc::new(StoreGuards::new()),
            registry: Arc::new(RunRegistry::new()),
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
        }
    }

    pub fn registry(&self) -> &Arc<RunRegistry> {
        &self.registry
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn is_running(&self, store: &StoreName) -> bool {
        self.guards.is_running(store)
    }

    /// Snapshot of every registered store.
    pub async fn list_stores(&self) -> Result<Vec<Store>, SchedulerError> {
        let catalog = Arc::clone(self.engine.catalog());
        tokio::task::spawn_blocking(move || catalog.list())
            .await
            .map_err(|e| SchedulerError::Catalog(e.to_string()))?
            .map_err(|e| SchedulerError::Catalog(e.to_string()))
    }

    /// Reconcile every registered store.
    pub async fn sync_all(&self, cancel: &CancellationToken) -> Result<SyncSummary, SchedulerError> {
        let stores = self.list_stores().await?;
        Ok(self.sync_stores(stores, cancel).await)
    }

    /// Reconcile the stores with `auto_sync` enabled.
    pub async fn sync_auto(&self, cancel: &CancellationToken) -> Result<SyncSummary, SchedulerError> {
        let stores: Vec<Store> = self
            .list_stores()
            .await?
            .into_iter()
            .filter(|store| store.config.auto_sync)
            .collect();
        Ok(self.sync_stores(stores, cancel).await)
    }

    /// Reconcile the given store snapshots, one task per store.
    pub async fn sync_stores(&self, stores: Vec<Store>, cancel: &CancellationToken) -> SyncSummary {
        info!(
            stores = stores.len(),
            concurrency = self.concurrency,
            "Sync started"
        );

        let mut tasks = JoinSet::new();
        for store in stores {
            let engine = Arc::clone(&self.engine);
            let guards = Arc::clone(&self.guards);
            let registry = Arc::clone(&self.registry);
            let permits = Arc::clone(&self.permits);
            let cancel = cancel.clone();

            tasks.spawn(async move {
                // A closed semaphore or cancellation still goes through
                // reconcile, which reports Cancelled without fetching.
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = permits.acquire_owned() => permit.ok(),
                };
                run_store(&engine, &guards, &registry, store, &cancel).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => error!(error = %e, "Store task failed to join"),
            }
        }
        results.sort_by(|a, b| a.store().cmp(b.store()));

        let summary = SyncSummary { results };
        info!(
            stores = summary.results.len(),
            failures = summary.failures(),
            skipped = summary.skipped(),
            "Sync finished"
        );
        summary
    }

    /// Reconcile a single store, honoring the overlap guard.
    pub async fn sync_store(&self, store: Store, cancel: &CancellationToken) -> StoreRunResult {
        let _permit = Arc::clone(&self.permits).acquire_owned().await.ok();
        run_store(&self.engine, &self.guards, &self.registry, store, cancel).await
    }
}

async fn run_store(
    engine: &ReconciliationEngine,
    guards: &StoreGuards,
    registry: &RunRegistry,
    store: Store,
    cancel: &CancellationToken,
) -> StoreRunResult {
    let Some(_run) = guards.try_acquire(&store.name) else {
        info!(store = %store.name, "Run already in flight, skipping");
        registry.record_skipped(&store.name);
        return StoreRunResult::Skipped { store: store.name };
    };

    registry.record_start(&store.name);
    let result = AssertUnwindSafe(engine.reconcile(&store, cancel))
        .catch_unwind()
        .await;

    match result {
        Ok(report) => {
            registry.record_complete(&report);
            match &report.outcome {
                RunOutcome::Halted(envelope) => {
                    error!(store = %store.name, error = %envelope, "Store halted")
                }
                RunOutcome::StoreDisappeared => {
                    info!(store = %store.name, "Store removed during run")
                }
                _ => {}
            }
            StoreRunResult::Completed(report)
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            warn!(store = %store.name, message = %message, "Store run panicked");
            registry.record_panicked(&store.name, &message);
            StoreRunResult::Panicked {
                store: store.name,
                message,
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
