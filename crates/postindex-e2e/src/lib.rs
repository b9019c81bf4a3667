//! End-to-end test infrastructure for postindex.
//!
//! Provides a shared [`TestHarness`] over a real on-disk catalog and RocksDB
//! event logs, plus failure-injecting wrappers for the checkpoint store,
//! event source and retry guard.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};

use postindex_indexing::{
    CheckpointError, CheckpointStore, EngineConfig, EventGuard, EventSource, GuardError,
    LocalEventSource, ReconciliationEngine, SourceError,
};
use postindex_storage::{Database, SqliteIndexStore, SqliteStoreCatalog};
use postindex_types::{
    Handle, Hashtag, IndexCheckpoint, IndexCommit, IndexName, Position, PositionScheme, PostEvent,
    PostIndexEntry, PostPayload, PostUri, Store, StoreConfig, StoreName,
};

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    pub catalog: Arc<SqliteStoreCatalog>,
    pub index: Arc<SqliteIndexStore>,
    pub source: Arc<LocalEventSource>,
    stores_dir: PathBuf,
}

impl TestHarness {
    /// Create a harness with a fresh catalog database and stores directory.
    pub fn new() -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let db = Database::open(&temp_dir.path().join("catalog.db"))
            .expect("Failed to open catalog database");
        let stores_dir = temp_dir.path().join("stores");

        Self {
            catalog: Arc::new(SqliteStoreCatalog::new(db.clone())),
            index: Arc::new(SqliteIndexStore::new(db)),
            source: Arc::new(LocalEventSource::new()),
            stores_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Register a store rooted under the harness directory.
    pub fn register(&self, name: &str, config: StoreConfig) -> Store {
        let name = StoreName::parse(name).expect("Invalid store name");
        let root = self.stores_dir.join(name.as_str());
        self.catalog
            .register(name, root, None, config)
            .expect("Failed to register store")
    }

    /// Append payloads to a store's event log, returning their positions.
    pub fn append(&self, store: &Store, payloads: &[PostPayload]) -> Vec<Position> {
        self.source
            .log_for(store)
            .expect("Failed to open event log")
            .append_batch(payloads)
            .expect("Failed to append events")
    }

    /// Engine over the harness catalog, index store and event logs.
    pub fn engine(&self, config: EngineConfig) -> ReconciliationEngine {
        self.engine_with(self.index.clone(), self.source.clone(), config)
    }

    /// Engine with a substituted checkpoint store and event source.
    pub fn engine_with(
        &self,
        checkpoints: Arc<dyn CheckpointStore>,
        source: Arc<dyn EventSource>,
        config: EngineConfig,
    ) -> ReconciliationEngine {
        ReconciliationEngine::new(self.catalog.clone(), checkpoints, source, config)
    }

    pub fn entries(&self, store: &Store, index: IndexName, key: &str) -> Vec<PostIndexEntry> {
        self.index
            .entries_for_key(&store.name, index, key)
            .expect("Failed to read entries")
    }

    pub fn entry_count(&self, store: &Store, index: IndexName) -> u64 {
        self.index
            .entry_count(&store.name, index)
            .expect("Failed to count entries")
    }

    pub fn checkpoints(&self, store: &Store) -> Vec<IndexCheckpoint> {
        self.index
            .list_checkpoints(&store.name)
            .expect("Failed to list checkpoints")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine config with millisecond backoffs.
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig::default()
        .with_batch_size(3)
        .with_retries(2, 2)
        .with_retry_delays(Duration::from_millis(1), Duration::from_millis(10))
}

/// A post by `author` with the given hashtags, created on `date` (YYYY-MM-DD).
pub fn post(author: &str, rkey: &str, tags: &[&str], date: &str) -> PostPayload {
    let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").expect("Invalid date");
    let created_at = Utc.from_utc_datetime(&day.and_hms_opt(12, 0, 0).expect("Invalid time"));
    PostPayload::new(
        PostUri::parse(&format!("at://{}/app.bsky.feed.post/{}", author, rkey))
            .expect("Invalid uri"),
        created_at,
    )
    .with_hashtags(tags.iter().map(|t| Hashtag::parse(t).expect("Invalid hashtag")))
    .with_author(Handle::parse(author).expect("Invalid handle"))
}

/// Checkpoint store that fails commits for one store.
///
/// Failures happen before anything reaches the inner store, like a crash
/// between projection and commit. `fail_times = u32::MAX` fails forever.
pub struct FlakyCheckpointStore {
    inner: Arc<dyn CheckpointStore>,
    target: Option<StoreName>,
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
}

impl FlakyCheckpointStore {
    pub fn new(inner: Arc<dyn CheckpointStore>, fail_times: u32) -> Self {
        Self {
            inner,
            target: None,
            remaining_failures: AtomicU32::new(fail_times),
            attempts: AtomicU32::new(0),
        }
    }

    /// Only fail commits for `store`.
    pub fn for_store(mut self, store: &StoreName) -> Self {
        self.target = Some(store.clone());
        self
    }

    /// Commit attempts seen, including failed ones.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn should_fail(&self, store: &StoreName) -> bool {
        if self.target.as_ref().is_some_and(|target| target != store) {
            return false;
        }
        self.remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok()
    }
}

impl CheckpointStore for FlakyCheckpointStore {
    fn load(&self, store: &StoreName, index: IndexName) -> Result<IndexCheckpoint, CheckpointError> {
        self.inner.load(store, index)
    }

    fn commit_batch(&self, store: &StoreName, commits: &[IndexCommit]) -> Result<(), CheckpointError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(store) {
            return Err(CheckpointError::Commit("injected commit failure".to_string()));
        }
        self.inner.commit_batch(store, commits)
    }

    fn rebuild_batch(&self, store: &StoreName, commits: &[IndexCommit]) -> Result<(), CheckpointError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(store) {
            return Err(CheckpointError::Commit("injected commit failure".to_string()));
        }
        self.inner.rebuild_batch(store, commits)
    }
}

/// Event source that returns transient errors before delegating.
pub struct FlakySource {
    inner: Arc<dyn EventSource>,
    remaining_failures: AtomicU32,
    calls: AtomicU32,
}

impl FlakySource {
    pub fn new(inner: Arc<dyn EventSource>, fail_times: u32) -> Self {
        Self {
            inner,
            remaining_failures: AtomicU32::new(fail_times),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventSource for FlakySource {
    fn scheme(&self) -> PositionScheme {
        self.inner.scheme()
    }

    async fn fetch(
        &self,
        store: &Store,
        after: Position,
        limit: usize,
    ) -> Result<Vec<PostEvent>, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SourceError::Transient("injected fetch failure".to_string()));
        }
        self.inner.fetch(store, after, limit).await
    }
}

/// Guard that fails its first `fail_times` checks and counts every call.
pub struct CountingGuard {
    remaining_failures: AtomicU32,
    calls: AtomicU32,
}

impl CountingGuard {
    pub fn failing(fail_times: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(fail_times),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventGuard for CountingGuard {
    async fn check(&self, event: &PostEvent) -> Result<(), GuardError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| match n {
                0 => None,
                u32::MAX => Some(u32::MAX),
                n => Some(n - 1),
            })
            .is_ok();
        if failing {
            return Err(GuardError::NotReady(format!("{} not ready", event.uri())));
        }
        Ok(())
    }
}
