//! Event sources: where the engine pulls a store's events from.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use postindex_storage::{EventLog, StorageError};
use postindex_types::{Position, PositionScheme, PostEvent, PostPayload, Store, StoreName};

/// Failure to fetch events
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// Retryable (unavailable, busy, timed out)
    #[error("Transient source failure: {0}")]
    Transient(String),

    /// Not retryable (corrupt data, misconfigured store)
    #[error("Fatal source failure: {0}")]
    Fatal(String),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

impl From<StorageError> for SourceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RocksDb(_) | StorageError::Io(_) | StorageError::LockPoisoned => {
                SourceError::Transient(err.to_string())
            }
            other => SourceError::Fatal(other.to_string()),
        }
    }
}

/// A position-ordered stream of events per store.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Addressing scheme of the positions this source returns
    fn scheme(&self) -> PositionScheme;

    /// Up to `limit` events of `store` with position > `after`, ascending.
    /// Empty when caught up.
    async fn fetch(
        &self,
        store: &Store,
        after: Position,
        limit: usize,
    ) -> Result<Vec<PostEvent>, SourceError>;
}

/// Reads each store's RocksDB event log under `<root>/events`.
///
/// Logs are opened on first use and kept open; RocksDB allows a single
/// handle per directory per process.
#[derive(Default)]
pub struct LocalEventSource {
    logs: Arc<Mutex<HashMap<StoreName, Arc<EventLog>>>>,
}

impl LocalEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store's event log, opening it if needed. Blocking.
    pub fn log_for(&self, store: &Store) -> Result<Arc<EventLog>, StorageError> {
        open_cached(&self.logs, store)
    }

    /// Forget a cached log handle (e.g. after the store is removed).
    pub fn evict(&self, store: &StoreName) -> bool {
        match self.logs.lock() {
            Ok(mut logs) => logs.remove(store).is_some(),
            Err(_) => false,
        }
    }
}

fn open_cached(
    logs: &Mutex<HashMap<StoreName, Arc<EventLog>>>,
    store: &Store,
) -> Result<Arc<EventLog>, StorageError> {
    let mut logs = logs.lock().map_err(|_| StorageError::LockPoisoned)?;
    if let Some(log) = logs.get(&store.name) {
        return Ok(Arc::clone(log));
    }
    std::fs::create_dir_all(&store.root)?;
    let log = Arc::new(EventLog::open(&store.events_path(), &store.name)?);
    logs.insert(store.name.clone(), Arc::clone(&log));
    Ok(log)
}

#[async_trait]
impl EventSource for LocalEventSource {
    fn scheme(&self) -> PositionScheme {
        PositionScheme::Sequence
    }

    async fn fetch(
        &self,
        store: &Store,
        after: Position,
        limit: usize,
    ) -> Result<Vec<PostEvent>, SourceError> {
        let logs = Arc::clone(&self.logs);
        let store = store.clone();
        let events = tokio::task::spawn_blocking(move || {
            let log = open_cached(&logs, &store)?;
            log.read_after(after, limit)
        })
        .await
        .map_err(|e| SourceError::Transient(format!("read task failed: {}", e)))??;

        debug!(after = %after, count = events.len(), "Fetched from local log");
        Ok(events)
    }
}

/// In-memory source addressed by caller-assigned event ids.
///
/// Ids must be positive and strictly increasing per store; gaps are fine.
#[derive(Default)]
pub struct MemoryEventSource {
    streams: RwLock<HashMap<StoreName, BTreeMap<u64, PostPayload>>>,
}

impl MemoryEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event under `event_id`.
    pub fn push(&self, store: &StoreName, event_id: u64, payload: PostPayload) -> Result<(), SourceError> {
        let mut streams = self
            .streams
            .write()
            .map_err(|_| SourceError::Fatal("stream lock poisoned".to_string()))?;
        let stream = streams.entry(store.clone()).or_default();

        let last = stream.keys().next_back().copied().unwrap_or(0);
        if event_id <= last {
            return Err(SourceError::Fatal(format!(
                "event id {} is not after {}",
                event_id, last
            )));
        }
        stream.insert(event_id, payload);
        Ok(())
    }

    /// Number of events held for a store
    pub fn len(&self, store: &StoreName) -> usize {
        self.streams
            .read()
            .map(|s| s.get(store).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, store: &StoreName) -> bool {
        self.len(store) == 0
    }
}

#[async_trait]
impl EventSource for MemoryEventSource {
    fn scheme(&self) -> PositionScheme {
        PositionScheme::EventId
    }

    async fn fetch(
        &self,
        store: &Store,
        after: Position,
        limit: usize,
    ) -> Result<Vec<PostEvent>, SourceError> {
        let streams = self
            .streams
            .read()
            .map_err(|_| SourceError::Fatal("stream lock poisoned".to_string()))?;
        let Some(stream) = streams.get(&store.name) else {
            return Ok(Vec::new());
        };

        let start = after.value().saturating_add(1);
        Ok(stream
            .range(start..)
            .take(limit)
            .map(|(id, payload)| payload.clone().at(Position::new(*id)))
            .collect())
    }
}
