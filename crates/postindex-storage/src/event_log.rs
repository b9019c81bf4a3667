//! RocksDB-backed append-only event log, one per store.
//!
//! Provides:
//! - Log open with column family setup and owner check
//! - Dense sequence assignment starting at 1
//! - Single and atomic batch appends
//! - Forward reads strictly after a position

use std::path::Path;
use std::sync::Mutex;

use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use tracing::{debug, info};

use postindex_types::{Position, PostEvent, PostPayload, StoreName};

use crate::column_families::{build_cf_descriptors, CF_EVENTS, CF_LOG_META};
use crate::error::StorageError;
use crate::keys::{EventKey, MetaKey};

/// Append-only event log for a single store
pub struct EventLog {
    db: DB,
    store: StoreName,
    /// Last assigned sequence. Held across the write so readers never
    /// observe sequence N+1 before N.
    last_sequence: Mutex<u64>,
}

impl EventLog {
    /// Open the log at the given path, creating it if necessary.
    ///
    /// A log records the store that created it; opening it under another
    /// store name is rejected.
    pub fn open(path: &Path, store: &StoreName) -> Result<Self, StorageError> {
        info!(store = %store, "Opening event log at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_compaction_style(rocksdb::DBCompactionStyle::Universal);
        db_opts.set_max_background_jobs(2);

        let db = DB::open_cf_descriptors(&db_opts, path, build_cf_descriptors())?;

        Self::claim_owner(&db, store)?;
        let last_sequence = Self::load_last_sequence(&db)?;

        Ok(Self {
            db,
            store: store.clone(),
            last_sequence: Mutex::new(last_sequence),
        })
    }

    fn claim_owner(db: &DB, store: &StoreName) -> Result<(), StorageError> {
        let cf = db
            .cf_handle(CF_LOG_META)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_LOG_META.to_string()))?;

        match db.get_cf(&cf, MetaKey::STORE.to_bytes())? {
            Some(owner) if owner.as_slice() != store.as_str().as_bytes() => {
                Err(StorageError::AlreadyExists(format!(
                    "event log belongs to store '{}'",
                    String::from_utf8_lossy(&owner)
                )))
            }
            Some(_) => Ok(()),
            None => {
                db.put_cf(&cf, MetaKey::STORE.to_bytes(), store.as_str().as_bytes())?;
                Ok(())
            }
        }
    }

    /// Load the highest assigned sequence (0 for an empty log)
    fn load_last_sequence(db: &DB) -> Result<u64, StorageError> {
        let cf = db
            .cf_handle(CF_EVENTS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_EVENTS.to_string()))?;

        let mut iter = db.iterator_cf(&cf, IteratorMode::End);
        if let Some(result) = iter.next() {
            let (key, _) = result?;
            return Ok(EventKey::from_bytes(&key)?.sequence);
        }
        Ok(0)
    }

    pub fn store(&self) -> &StoreName {
        &self.store
    }

    /// Append one event, returning its assigned position.
    pub fn append(&self, payload: &PostPayload) -> Result<Position, StorageError> {
        let mut positions = self.append_batch(std::slice::from_ref(payload))?;
        positions
            .pop()
            .ok_or_else(|| StorageError::Key("append assigned no position".to_string()))
    }

    /// Append events atomically, returning their positions in order.
    pub fn append_batch(&self, payloads: &[PostPayload]) -> Result<Vec<Position>, StorageError> {
        if payloads.is_empty() {
            return Ok(Vec::new());
        }

        let cf = self
            .db
            .cf_handle(CF_EVENTS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_EVENTS.to_string()))?;

        let mut last = self
            .last_sequence
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;

        let mut batch = WriteBatch::default();
        let mut positions = Vec::with_capacity(payloads.len());
        let mut sequence = *last;
        for payload in payloads {
            sequence += 1;
            batch.put_cf(&cf, EventKey::new(sequence).to_bytes(), payload.to_bytes()?);
            positions.push(Position::new(sequence));
        }

        self.db.write(batch)?;
        *last = sequence;

        debug!(
            store = %self.store,
            count = positions.len(),
            last = sequence,
            "Appended events"
        );
        Ok(positions)
    }

    /// Read up to `limit` events with position strictly greater than `after`,
    /// in ascending position order.
    pub fn read_after(&self, after: Position, limit: usize) -> Result<Vec<PostEvent>, StorageError> {
        let cf = self
            .db
            .cf_handle(CF_EVENTS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_EVENTS.to_string()))?;

        let start = EventKey::after(after).to_bytes();
        let iter = self
            .db
            .iterator_cf(&cf, IteratorMode::From(&start, Direction::Forward));

        let mut events = Vec::new();
        for item in iter.take(limit) {
            let (key, value) = item?;
            let key = EventKey::from_bytes(&key)?;
            let payload = PostPayload::from_bytes(&value)?;
            events.push(payload.at(key.position()));
        }
        Ok(events)
    }

    /// Position of the newest event (zero if empty)
    pub fn last_position(&self) -> Result<Position, StorageError> {
        let last = self
            .last_sequence
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(Position::new(*last))
    }

    /// Flush memtables to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        let cf = self
            .db
            .cf_handle(CF_EVENTS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_EVENTS.to_string()))?;
        self.db.flush_cf(&cf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use postindex_types::{Hashtag, PostUri};
    use tempfile::TempDir;

    fn store() -> StoreName {
        StoreName::parse("news").unwrap()
    }

    fn payload(n: u32) -> PostPayload {
        PostPayload::new(
            PostUri::parse(&format!("at://alice.example.com/app.bsky.feed.post/{}", n)).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
        )
        .with_hashtags([Hashtag::parse("rust").unwrap()])
    }

    fn create_test_log() -> (EventLog, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let log = EventLog::open(temp_dir.path(), &store()).unwrap();
        (log, temp_dir)
    }

    #[test]
    fn test_empty_log() {
        let (log, _dir) = create_test_log();
        assert_eq!(log.last_position().unwrap(), Position::ZERO);
        assert!(log.read_after(Position::ZERO, 10).unwrap().is_empty());
    }

    #[test]
    fn test_append_assigns_dense_positions() {
        let (log, _dir) = create_test_log();
        assert_eq!(log.append(&payload(1)).unwrap(), Position::new(1));
        let batch = log.append_batch(&[payload(2), payload(3)]).unwrap();
        assert_eq!(batch, vec![Position::new(2), Position::new(3)]);
        assert_eq!(log.last_position().unwrap(), Position::new(3));
    }

    #[test]
    fn test_read_after_is_exclusive_and_limited() {
        let (log, _dir) = create_test_log();
        let payloads: Vec<_> = (1..=12).map(payload).collect();
        log.append_batch(&payloads).unwrap();

        let events = log.read_after(Position::new(3), 5).unwrap();
        let positions: Vec<u64> = events.iter().map(|e| e.position.value()).collect();
        assert_eq!(positions, vec![4, 5, 6, 7, 8]);
        assert_eq!(events[0].payload, payloads[3]);

        let tail = log.read_after(Position::new(10), 100).unwrap();
        assert_eq!(tail.len(), 2);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let log = EventLog::open(temp_dir.path(), &store()).unwrap();
            log.append_batch(&[payload(1), payload(2)]).unwrap();
            log.flush().unwrap();
        }
        let log = EventLog::open(temp_dir.path(), &store()).unwrap();
        assert_eq!(log.last_position().unwrap(), Position::new(2));
        assert_eq!(log.append(&payload(3)).unwrap(), Position::new(3));
    }

    #[test]
    fn test_log_rejects_foreign_store() {
        let temp_dir = TempDir::new().unwrap();
        drop(EventLog::open(temp_dir.path(), &store()).unwrap());

        let other = StoreName::parse("other").unwrap();
        let result = EventLog::open(temp_dir.path(), &other);
        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
    }
}
