//! Per-store reconciliation.
//!
//! A run repeatedly fetches the next batch of events after the lowest index
//! checkpoint, evaluates filter policies once per event, projects admitted
//! events into every index that has not seen them, and commits all indexes'
//! mutations with their advanced checkpoints in one transaction. It ends
//! when the source is drained, on a halting error, when the store leaves
//! the catalog, or on cancellation.

use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use postindex_storage::StoreCatalog;
use postindex_types::{
    EngineSettings, ErrorEnvelope, ErrorKind, IndexCheckpoint, IndexCommit, IndexName, Position,
    PostEvent, Store, StoreName, SyncPolicy,
};

use crate::checkpoint::{CheckpointError, CheckpointStore};
use crate::error::IndexingError;
use crate::policy::{evaluate, run_guarded, Disposition, EventGuard, GuardOutcome, ProjectionGuard};
use crate::projector::{fold, project_index};
use crate::retry;
use crate::source::{EventSource, SourceError};

/// Configuration for the reconciliation engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Maximum events fetched per batch
    pub batch_size: usize,
    /// Retries of a transient fetch failure before halting
    pub max_fetch_retries: u32,
    /// Retries of a failed commit before halting
    pub max_commit_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// End the run as drained after this many batches
    pub max_batches_per_run: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::from(&EngineSettings::default())
    }
}

impl From<&EngineSettings> for EngineConfig {
    fn from(settings: &EngineSettings) -> Self {
        Self {
            batch_size: settings.batch_size,
            max_fetch_retries: settings.max_fetch_retries,
            max_commit_retries: settings.max_commit_retries,
            retry_base_delay: settings.retry_base_delay(),
            retry_max_delay: settings.retry_max_delay(),
            max_batches_per_run: settings.max_batches_per_run,
        }
    }
}

impl EngineConfig {
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_retries(mut self, fetch: u32, commit: u32) -> Self {
        self.max_fetch_retries = fetch;
        self.max_commit_retries = commit;
        self
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_max_delay = max;
        self
    }

    pub fn with_max_batches(mut self, max_batches: Option<usize>) -> Self {
        self.max_batches_per_run = max_batches;
        self
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Caught up with the source (or hit the batch limit)
    Drained,
    /// Stopped on an error; checkpoints stay at the last good commit
    Halted(ErrorEnvelope),
    /// Store was removed from the catalog mid-run
    StoreDisappeared,
    Cancelled,
}

impl RunOutcome {
    pub fn is_halted(&self) -> bool {
        matches!(self, RunOutcome::Halted(_))
    }
}

/// Summary of one store's run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileReport {
    pub store: StoreName,
    pub outcome: RunOutcome,
    /// Batches committed
    pub batches: usize,
    pub fetched: u64,
    pub admitted: u64,
    pub excluded: u64,
    /// Events excluded after exhausting a Retry policy
    pub policy_failures: u64,
    pub fetch_retries: u32,
    pub commit_retries: u32,
    /// Checkpoints after the last successful commit
    pub checkpoints: Vec<IndexCheckpoint>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileReport {
    fn new(store: StoreName) -> Self {
        let now = Utc::now();
        Self {
            store,
            outcome: RunOutcome::Drained,
            batches: 0,
            fetched: 0,
            admitted: 0,
            excluded: 0,
            policy_failures: 0,
            fetch_retries: 0,
            commit_retries: 0,
            checkpoints: Vec::new(),
            started_at: now,
            finished_at: now,
        }
    }

    fn finish(mut self, outcome: RunOutcome) -> Self {
        self.outcome = outcome;
        self.finished_at = Utc::now();
        self
    }

    pub fn is_halted(&self) -> bool {
        self.outcome.is_halted()
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or_default()
    }
}

/// Why the batch loop stopped early
enum Stop {
    Halted(ErrorEnvelope),
    Disappeared,
    Cancelled,
}

impl From<Stop> for RunOutcome {
    fn from(stop: Stop) -> Self {
        match stop {
            Stop::Halted(envelope) => RunOutcome::Halted(envelope),
            Stop::Disappeared => RunOutcome::StoreDisappeared,
            Stop::Cancelled => RunOutcome::Cancelled,
        }
    }
}

/// Outcome of evaluating one fetched batch
#[derive(Default)]
struct Admission {
    admitted: Vec<PostEvent>,
    excluded: u64,
    policy_failures: u64,
}

/// Reconciles stores against their event source.
pub struct ReconciliationEngine {
    catalog: Arc<dyn StoreCatalog>,
    checkpoints: Arc<dyn CheckpointStore>,
    source: Arc<dyn EventSource>,
    guard: Arc<dyn EventGuard>,
    config: EngineConfig,
}

impl ReconciliationEngine {
    pub fn new(
        catalog: Arc<dyn StoreCatalog>,
        checkpoints: Arc<dyn CheckpointStore>,
        source: Arc<dyn EventSource>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            checkpoints,
            source,
            guard: Arc::new(ProjectionGuard::default()),
            config,
        }
    }

    /// Replace the guard used for `Retry` policies.
    pub fn with_guard(mut self, guard: Arc<dyn EventGuard>) -> Self {
        self.guard = guard;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<dyn StoreCatalog> {
        &self.catalog
    }

    /// Run one store until drained, halted, removed or cancelled.
    ///
    /// `store` is the configuration snapshot for the whole run; catalog
    /// edits take effect on the next run.
    pub async fn reconcile(&self, store: &Store, cancel: &CancellationToken) -> ReconcileReport {
        let mut report = ReconcileReport::new(store.name.clone());
        info!(store = %store.name, "Reconciliation started");

        let result = self.run_batches(store, cancel, &mut report).await;
        let outcome = match result {
            Ok(()) => RunOutcome::Drained,
            Err(stop) => RunOutcome::from(stop),
        };

        match &outcome {
            RunOutcome::Halted(envelope) => error!(
                store = %store.name,
                error = %envelope.error,
                message = %envelope.message,
                batches = report.batches,
                "Reconciliation halted"
            ),
            other => info!(
                store = %store.name,
                outcome = ?other,
                batches = report.batches,
                admitted = report.admitted,
                excluded = report.excluded,
                policy_failures = report.policy_failures,
                "Reconciliation finished"
            ),
        }
        report.finish(outcome)
    }

    async fn run_batches(
        &self,
        store: &Store,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> Result<(), Stop> {
        let indexes = store.config.enabled_indexes();
        if indexes.is_empty() {
            debug!(store = %store.name, "No indexes configured");
            return Ok(());
        }

        let persisted = self.load_checkpoints(&store.name, &indexes).await.map_err(|e| {
            Stop::Halted(
                envelope_for(&store.name, ErrorKind::CheckpointLoadError, &e.to_string())
                    .with_fix("Check the catalog database is readable; no index state was changed"),
            )
        })?;
        report.checkpoints = persisted.clone();

        // A refresh rebuilds from zero. The old state is dropped inside the
        // first rebuilt batch's transaction, so a run that stops before that
        // commit leaves it untouched.
        let mut pending_reset = store.config.sync_policy == SyncPolicy::Refresh;
        let mut checkpoints: Vec<IndexCheckpoint> = if pending_reset {
            indexes
                .iter()
                .map(|index| IndexCheckpoint::new(store.name.clone(), *index))
                .collect()
        } else {
            self.check_scheme(&store.name, &persisted)?;
            persisted
        };
        // A partial rebuild would be thrown away by the next refresh run
        let max_batches = self.config.max_batches_per_run.filter(|_| !pending_reset);

        loop {
            if let Some(max) = max_batches {
                if report.batches >= max {
                    info!(store = %store.name, batches = max, "Reached max batches per run");
                    return Ok(());
                }
            }
            if cancel.is_cancelled() {
                return Err(Stop::Cancelled);
            }
            self.ensure_registered(&store.name)?;

            let from = checkpoints
                .iter()
                .map(|cp| cp.last_position)
                .min()
                .unwrap_or(Position::ZERO);

            let events = self.fetch_with_retry(store, from, cancel, report).await?;
            let Some(last_position) = events.last().map(|e| e.position) else {
                if pending_reset {
                    self.commit_with_retry(&store.name, Vec::new(), true, cancel, report)
                        .await?;
                    report.checkpoints = checkpoints.clone();
                }
                debug!(store = %store.name, position = %from, "Caught up");
                return Ok(());
            };
            report.fetched += events.len() as u64;

            let admission = self.admit(store, events, cancel).await?;

            let commits: Vec<IndexCommit> = checkpoints
                .iter()
                .filter(|cp| last_position > cp.last_position)
                .map(|cp| {
                    let pending: Vec<&PostEvent> = admission
                        .admitted
                        .iter()
                        .filter(|e| e.position > cp.last_position)
                        .collect();
                    let mutations = fold(pending.iter().map(|e| project_index(e, cp.index)));
                    let next = cp.advanced(last_position, self.source.scheme(), pending.len() as u64);
                    IndexCommit::new(next, mutations)
                })
                .collect();

            self.commit_with_retry(&store.name, commits.clone(), pending_reset, cancel, report)
                .await?;
            pending_reset = false;

            for commit in commits {
                if let Some(slot) = checkpoints.iter_mut().find(|cp| cp.index == commit.index()) {
                    *slot = commit.checkpoint;
                }
            }
            report.batches += 1;
            report.admitted += admission.admitted.len() as u64;
            report.excluded += admission.excluded;
            report.policy_failures += admission.policy_failures;
            report.checkpoints = checkpoints.clone();

            info!(
                store = %store.name,
                last_position = %last_position,
                admitted = admission.admitted.len(),
                excluded = admission.excluded,
                "Committed batch"
            );
        }
    }

    fn ensure_registered(&self, store: &StoreName) -> Result<(), Stop> {
        match self.catalog.contains(store) {
            Ok(true) => Ok(()),
            Ok(false) => {
                info!(store = %store, "Store left the catalog, stopping");
                Err(Stop::Disappeared)
            }
            Err(e) => {
                warn!(store = %store, error = %e, "Catalog check failed, continuing");
                Ok(())
            }
        }
    }

    fn check_scheme(&self, store: &StoreName, checkpoints: &[IndexCheckpoint]) -> Result<(), Stop> {
        let scheme = self.source.scheme();
        match checkpoints.iter().find(|cp| !cp.is_fresh() && cp.scheme != scheme) {
            None => Ok(()),
            Some(cp) => Err(Stop::Halted(
                envelope_for(
                    store,
                    ErrorKind::AddressingMismatch,
                    &format!(
                        "checkpoint for index '{}' uses {} positions but the source uses {}",
                        cp.index, cp.scheme, scheme
                    ),
                )
                .with_received(scheme.as_str())
                .with_expected(cp.scheme.as_str())
                .with_fix("Set syncPolicy to refresh to rebuild the store's indexes from the new source"),
            )),
        }
    }

    async fn admit(
        &self,
        store: &Store,
        events: Vec<PostEvent>,
        cancel: &CancellationToken,
    ) -> Result<Admission, Stop> {
        let mut admission = Admission::default();
        for event in events {
            match evaluate(&event, &store.config.filters) {
                Disposition::Include => admission.admitted.push(event),
                Disposition::Exclude => admission.excluded += 1,
                Disposition::Retry(policy) => {
                    match run_guarded(
                        self.guard.as_ref(),
                        &event,
                        &policy,
                        self.config.retry_max_delay,
                        cancel,
                    )
                    .await
                    {
                        GuardOutcome::Admitted { .. } => admission.admitted.push(event),
                        GuardOutcome::Exhausted { attempts, error } => {
                            warn!(
                                store = %store.name,
                                uri = %event.uri(),
                                position = %event.position,
                                attempts,
                                error = %error,
                                kind = %ErrorKind::PerEventPolicyFailure,
                                "Event excluded after policy retries"
                            );
                            admission.excluded += 1;
                            admission.policy_failures += 1;
                        }
                        GuardOutcome::Cancelled { .. } => return Err(Stop::Cancelled),
                    }
                }
            }
        }
        Ok(admission)
    }

    async fn fetch_with_retry(
        &self,
        store: &Store,
        after: Position,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> Result<Vec<PostEvent>, Stop> {
        let mut backoff = retry::exponential(self.config.retry_base_delay, self.config.retry_max_delay);
        let mut retries = 0;

        loop {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Stop::Cancelled),
                fetched = self.source.fetch(store, after, self.config.batch_size) => fetched,
            };

            let error = match fetched {
                Ok(events) => return Ok(events),
                Err(SourceError::Fatal(message)) => {
                    return Err(Stop::Halted(
                        envelope_for(&store.name, ErrorKind::SourceError, &message)
                            .with_fix("Inspect the store's event source; the run will not retry"),
                    ))
                }
                Err(SourceError::Transient(message)) => message,
            };

            if retries >= self.config.max_fetch_retries {
                return Err(Stop::Halted(
                    envelope_for(
                        &store.name,
                        ErrorKind::TransientFetchError,
                        &format!("event source unavailable after {} retries: {}", retries, error),
                    )
                    .with_fix("Check the event source and rerun sync; progress is kept"),
                ));
            }

            retries += 1;
            report.fetch_retries += 1;
            let delay = backoff.next_backoff().unwrap_or(self.config.retry_max_delay);
            warn!(
                store = %store.name,
                attempt = retries,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Fetch failed, retrying"
            );
            if !retry::sleep_or_cancel(delay, cancel).await {
                return Err(Stop::Cancelled);
            }
        }
    }

    /// Commit on the blocking pool. A started commit always runs to
    /// completion; cancellation is only observed between attempts.
    ///
    /// With `reset`, the store's previous index state is dropped in the
    /// same transaction.
    async fn commit_with_retry(
        &self,
        store: &StoreName,
        commits: Vec<IndexCommit>,
        reset: bool,
        cancel: &CancellationToken,
        report: &mut ReconcileReport,
    ) -> Result<(), Stop> {
        if commits.is_empty() && !reset {
            return Ok(());
        }

        let commits = Arc::new(commits);
        let mut backoff = retry::exponential(self.config.retry_base_delay, self.config.retry_max_delay);
        let mut retries = 0;

        loop {
            let checkpoints = Arc::clone(&self.checkpoints);
            let batch = Arc::clone(&commits);
            let name = store.clone();
            let result = tokio::task::spawn_blocking(move || {
                if reset {
                    checkpoints.rebuild_batch(&name, &batch)
                } else {
                    checkpoints.commit_batch(&name, &batch)
                }
            })
            .await
                .unwrap_or_else(|e| Err(CheckpointError::Commit(format!("commit task failed: {}", e))));

            let error = match result {
                Ok(()) => return Ok(()),
                Err(e) if !e.is_retryable() => {
                    let envelope = match e {
                        CheckpointError::OutOfOrder { .. } => {
                            envelope_for(store, ErrorKind::OutOfOrderCheckpointError, &e.to_string())
                                .with_fix("Another writer advanced this store; rerun sync to resume from its checkpoint")
                        }
                        CheckpointError::Load(_) => {
                            envelope_for(store, ErrorKind::CheckpointLoadError, &e.to_string())
                        }
                        _ => envelope_for(store, ErrorKind::CommitError, &e.to_string()),
                    };
                    return Err(Stop::Halted(envelope));
                }
                Err(e) => e,
            };

            if retries >= self.config.max_commit_retries {
                return Err(Stop::Halted(
                    envelope_for(
                        store,
                        ErrorKind::CommitError,
                        &format!("commit failed after {} retries: {}", retries, error),
                    )
                    .with_fix("Check the catalog database is writable; the batch will be refetched"),
                ));
            }

            retries += 1;
            report.commit_retries += 1;
            let delay = backoff.next_backoff().unwrap_or(self.config.retry_max_delay);
            warn!(
                store = %store,
                attempt = retries,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "Commit failed, retrying"
            );
            if !retry::sleep_or_cancel(delay, cancel).await {
                return Err(Stop::Cancelled);
            }
        }
    }

    async fn load_checkpoints(
        &self,
        store: &StoreName,
        indexes: &[IndexName],
    ) -> Result<Vec<IndexCheckpoint>, IndexingError> {
        let checkpoints = Arc::clone(&self.checkpoints);
        let name = store.clone();
        let indexes = indexes.to_vec();
        let loaded = tokio::task::spawn_blocking(move || {
            indexes
                .iter()
                .map(|index| checkpoints.load(&name, *index))
                .collect::<Result<Vec<_>, _>>()
        })
        .await??;

        for checkpoint in &loaded {
            debug!(
                store = %store,
                index = %checkpoint.index,
                last_position = %checkpoint.last_position,
                "Loaded checkpoint"
            );
        }
        Ok(loaded)
    }
}

fn envelope_for(store: &StoreName, kind: ErrorKind, message: &str) -> ErrorEnvelope {
    ErrorEnvelope::new(kind, message).with_details(serde_json::json!({ "store": store.as_str() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use postindex_storage::{Database, SqliteIndexStore, SqliteStoreCatalog};
    use postindex_types::{
        EventPredicate, FilterRule, Hashtag, PositionScheme, PostPayload, PostUri, RetryPolicy,
        StoreConfig,
    };
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::policy::GuardError;
    use crate::source::MemoryEventSource;

    struct Fixture {
        catalog: Arc<SqliteStoreCatalog>,
        index: Arc<SqliteIndexStore>,
        source: Arc<MemoryEventSource>,
    }

    impl Fixture {
        fn new() -> Self {
            let db = Database::open_in_memory().unwrap();
            Self {
                catalog: Arc::new(SqliteStoreCatalog::new(db.clone())),
                index: Arc::new(SqliteIndexStore::new(db)),
                source: Arc::new(MemoryEventSource::new()),
            }
        }

        fn register(&self, name: &str, config: StoreConfig) -> Store {
            self.catalog
                .register(
                    StoreName::parse(name).unwrap(),
                    PathBuf::from(format!("/tmp/{}", name)),
                    None,
                    config,
                )
                .unwrap()
        }

        fn engine(&self, config: EngineConfig) -> ReconciliationEngine {
            ReconciliationEngine::new(
                self.catalog.clone(),
                self.index.clone(),
                self.source.clone(),
                config,
            )
        }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig::default()
            .with_batch_size(2)
            .with_retry_delays(Duration::from_millis(1), Duration::from_millis(5))
    }

    fn post(n: u64, tags: &[&str]) -> PostPayload {
        PostPayload::new(
            PostUri::parse(&format!("at://hal.example.com/app.bsky.feed.post/{}", n)).unwrap(),
            Utc.with_ymd_and_hms(2024, 8, 1, 10, 0, 0).unwrap(),
        )
        .with_hashtags(tags.iter().map(|t| Hashtag::parse(t).unwrap()))
    }

    fn tag(value: &str) -> EventPredicate {
        EventPredicate::Hashtag(Hashtag::parse(value).unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_drains_in_batches() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        for n in 1..=5 {
            fx.source.push(&store.name, n * 10, post(n, &["rust"])).unwrap();
        }

        let report = fx
            .engine(fast_config())
            .reconcile(&store, &CancellationToken::new())
            .await;

        assert_eq!(report.outcome, RunOutcome::Drained);
        assert_eq!(report.batches, 3);
        assert_eq!(report.fetched, 5);
        assert_eq!(report.admitted, 5);
        assert_eq!(report.checkpoints.len(), 3);
        for cp in &report.checkpoints {
            assert_eq!(cp.last_position, Position::new(50));
            assert_eq!(cp.scheme, PositionScheme::EventId);
        }
        assert_eq!(
            fx.index
                .entries_for_key(&store.name, IndexName::Hashtag, "rust")
                .unwrap()
                .len(),
            5
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_excluded_events_still_advance_checkpoint() {
        let fx = Fixture::new();
        let config = StoreConfig::default().with_filters(vec![FilterRule::exclude(tag("spam"))]);
        let store = fx.register("news", config);
        fx.source.push(&store.name, 1, post(1, &["spam"])).unwrap();
        fx.source.push(&store.name, 2, post(2, &["ok"])).unwrap();

        let report = fx
            .engine(fast_config())
            .reconcile(&store, &CancellationToken::new())
            .await;
        assert_eq!(report.excluded, 1);
        assert_eq!(report.admitted, 1);
        assert!(fx
            .index
            .entries_for_key(&store.name, IndexName::Hashtag, "spam")
            .unwrap()
            .is_empty());
        let cp = fx.index.load(&store.name, IndexName::Hashtag).unwrap();
        assert_eq!(cp.last_position, Position::new(2));
        assert_eq!(cp.event_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rerun_is_noop() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        fx.source.push(&store.name, 1, post(1, &["a"])).unwrap();

        let engine = fx.engine(fast_config());
        engine.reconcile(&store, &CancellationToken::new()).await;
        let again = engine.reconcile(&store, &CancellationToken::new()).await;
        assert_eq!(again.outcome, RunOutcome::Drained);
        assert_eq!(again.batches, 0);
        assert_eq!(again.fetched, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disappeared_store_stops() {
        let fx = Fixture::new();
        let store = fx.register("gone", StoreConfig::default());
        fx.source.push(&store.name, 1, post(1, &["a"])).unwrap();
        fx.catalog.remove(&store.name).unwrap();

        let report = fx
            .engine(fast_config())
            .reconcile(&store, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome, RunOutcome::StoreDisappeared);
        assert_eq!(report.batches, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_before_start() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        fx.source.push(&store.name, 1, post(1, &["a"])).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = fx.engine(fast_config()).reconcile(&store, &cancel).await;
        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert!(fx.index.load(&store.name, IndexName::Date).unwrap().is_fresh());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_max_batches_bounds_run() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        for n in 1..=6 {
            fx.source.push(&store.name, n, post(n, &["a"])).unwrap();
        }
        let report = fx
            .engine(fast_config().with_max_batches(Some(1)))
            .reconcile(&store, &CancellationToken::new())
            .await;
        assert_eq!(report.outcome, RunOutcome::Drained);
        assert_eq!(report.batches, 1);
        assert_eq!(
            fx.index.load(&store.name, IndexName::Hashtag).unwrap().last_position,
            Position::new(2)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_scheme_mismatch_halts() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        let sequence_cp = IndexCheckpoint::new(store.name.clone(), IndexName::Hashtag).advanced(
            Position::new(4),
            PositionScheme::Sequence,
            0,
        );
        fx.index.commit(&store.name, sequence_cp, vec![]).unwrap();
        fx.source.push(&store.name, 9, post(9, &["a"])).unwrap();

        let report = fx
            .engine(fast_config())
            .reconcile(&store, &CancellationToken::new())
            .await;
        match report.outcome {
            RunOutcome::Halted(envelope) => {
                assert_eq!(envelope.error, ErrorKind::AddressingMismatch);
                assert_eq!(envelope.received.as_deref(), Some("event_id"));
            }
            other => panic!("expected halt, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_rebuilds_from_start() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        fx.source.push(&store.name, 1, post(1, &["old"])).unwrap();
        fx.engine(fast_config())
            .reconcile(&store, &CancellationToken::new())
            .await;

        let refreshed = fx
            .catalog
            .update_config(
                &store.name,
                StoreConfig::default()
                    .with_sync_policy(SyncPolicy::Refresh)
                    .with_filters(vec![FilterRule::exclude(tag("old"))]),
            )
            .unwrap();
        let report = fx
            .engine(fast_config())
            .reconcile(&refreshed, &CancellationToken::new())
            .await;

        assert_eq!(report.fetched, 1);
        assert_eq!(report.excluded, 1);
        assert!(fx
            .index
            .entries_for_key(&store.name, IndexName::Hashtag, "old")
            .unwrap()
            .is_empty());
    }

    fn switch_to_refresh(fx: &Fixture, store: &Store) -> Store {
        fx.catalog
            .update_config(
                &store.name,
                StoreConfig::default().with_sync_policy(SyncPolicy::Refresh),
            )
            .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_refresh_keeps_index_state() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        fx.source.push(&store.name, 1, post(1, &["keep"])).unwrap();
        fx.engine(fast_config())
            .reconcile(&store, &CancellationToken::new())
            .await;

        let refreshed = switch_to_refresh(&fx, &store);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = fx.engine(fast_config()).reconcile(&refreshed, &cancel).await;

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(
            fx.index.load(&store.name, IndexName::Hashtag).unwrap().last_position,
            Position::new(1)
        );
        assert_eq!(
            fx.index
                .entries_for_key(&store.name, IndexName::Hashtag, "keep")
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_removed_refresh_store_is_not_wiped() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        fx.source.push(&store.name, 1, post(1, &["keep"])).unwrap();
        fx.engine(fast_config())
            .reconcile(&store, &CancellationToken::new())
            .await;

        let refreshed = switch_to_refresh(&fx, &store);
        fx.catalog.remove(&store.name).unwrap();
        // Removal deletes index rows itself; put one back to see that the
        // run does not touch it.
        let cp = IndexCheckpoint::new(store.name.clone(), IndexName::Date).advanced(
            Position::new(1),
            PositionScheme::EventId,
            0,
        );
        fx.index.commit(&store.name, cp, vec![]).unwrap();

        let report = fx
            .engine(fast_config())
            .reconcile(&refreshed, &CancellationToken::new())
            .await;

        assert_eq!(report.outcome, RunOutcome::StoreDisappeared);
        assert_eq!(
            fx.index.load(&store.name, IndexName::Date).unwrap().last_position,
            Position::new(1)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_runs_past_batch_limit() {
        let fx = Fixture::new();
        let store = fx.register(
            "news",
            StoreConfig::default().with_sync_policy(SyncPolicy::Refresh),
        );
        for n in 1..=6 {
            fx.source.push(&store.name, n, post(n, &["a"])).unwrap();
        }
        let engine = fx.engine(fast_config().with_max_batches(Some(1)));

        for _ in 0..2 {
            let report = engine.reconcile(&store, &CancellationToken::new()).await;
            assert_eq!(report.outcome, RunOutcome::Drained);
            assert_eq!(report.batches, 3);
            assert_eq!(
                fx.index.load(&store.name, IndexName::Hashtag).unwrap().last_position,
                Position::new(6)
            );
        }
        assert_eq!(
            fx.index
                .entries_for_key(&store.name, IndexName::Hashtag, "a")
                .unwrap()
                .len(),
            6
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_refresh_of_empty_source_clears_state() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        let cp = IndexCheckpoint::new(store.name.clone(), IndexName::Date).advanced(
            Position::new(3),
            PositionScheme::EventId,
            0,
        );
        fx.index.commit(&store.name, cp, vec![]).unwrap();

        let refreshed = switch_to_refresh(&fx, &store);
        let report = fx
            .engine(fast_config())
            .reconcile(&refreshed, &CancellationToken::new())
            .await;

        assert_eq!(report.outcome, RunOutcome::Drained);
        assert!(fx.index.load(&store.name, IndexName::Date).unwrap().is_fresh());
        assert!(report.checkpoints.iter().all(|cp| cp.is_fresh()));
    }

    struct UnreadableCheckpoints;

    impl CheckpointStore for UnreadableCheckpoints {
        fn load(&self, _store: &StoreName, _index: IndexName) -> Result<IndexCheckpoint, CheckpointError> {
            Err(CheckpointError::Load("database is locked".to_string()))
        }

        fn commit_batch(&self, _store: &StoreName, _commits: &[IndexCommit]) -> Result<(), CheckpointError> {
            Ok(())
        }

        fn rebuild_batch(&self, _store: &StoreName, _commits: &[IndexCommit]) -> Result<(), CheckpointError> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_checkpoint_load_failure_is_not_a_commit_error() {
        let fx = Fixture::new();
        let store = fx.register("news", StoreConfig::default());
        fx.source.push(&store.name, 1, post(1, &["a"])).unwrap();

        let engine = ReconciliationEngine::new(
            fx.catalog.clone(),
            Arc::new(UnreadableCheckpoints),
            fx.source.clone(),
            fast_config(),
        );
        let report = engine.reconcile(&store, &CancellationToken::new()).await;

        match report.outcome {
            RunOutcome::Halted(envelope) => {
                assert_eq!(envelope.error, ErrorKind::CheckpointLoadError);
                assert!(!envelope
                    .fix
                    .unwrap_or_default()
                    .contains("Another writer"));
            }
            other => panic!("expected halt, got {:?}", other),
        }
        assert_eq!(report.fetched, 0);
    }

    struct AlwaysNotReady(AtomicU32);

    #[async_trait]
    impl EventGuard for AlwaysNotReady {
        async fn check(&self, _event: &PostEvent) -> Result<(), GuardError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(GuardError::NotReady("never".to_string()))
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retry_exhaustion_counts_policy_failure() {
        let fx = Fixture::new();
        let policy = RetryPolicy::new(2, Duration::from_millis(1)).unwrap();
        let store = fx.register(
            "news",
            StoreConfig::default().with_filters(vec![FilterRule::retry(tag("slow"), policy)]),
        );
        fx.source.push(&store.name, 1, post(1, &["slow"])).unwrap();
        fx.source.push(&store.name, 2, post(2, &["fast"])).unwrap();

        let guard = Arc::new(AlwaysNotReady(AtomicU32::new(0)));
        let report = fx
            .engine(fast_config())
            .with_guard(guard.clone())
            .reconcile(&store, &CancellationToken::new())
            .await;

        assert_eq!(report.outcome, RunOutcome::Drained);
        assert_eq!(guard.0.load(Ordering::SeqCst), 3);
        assert_eq!(report.policy_failures, 1);
        assert_eq!(report.excluded, 1);
        assert_eq!(report.admitted, 1);
    }

    #[test]
    fn test_report_serializes_outcome() {
        let report = ReconcileReport::new(StoreName::parse("news").unwrap()).finish(
            RunOutcome::Halted(ErrorEnvelope::new(ErrorKind::CommitError, "disk full")),
        );
        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["store"], "news");
        assert_eq!(value["outcome"]["status"], "halted");
        assert_eq!(value["outcome"]["error"], "CommitError");
        assert_eq!(value["policyFailures"], 0);
    }

    #[test]
    fn test_config_from_settings() {
        let settings = EngineSettings {
            batch_size: 7,
            max_batches_per_run: Some(3),
            ..Default::default()
        };
        let config = EngineConfig::from(&settings);
        assert_eq!(config.batch_size, 7);
        assert_eq!(config.max_batches_per_run, Some(3));
        assert_eq!(config.retry_base_delay, Duration::from_millis(100));
    }
}
