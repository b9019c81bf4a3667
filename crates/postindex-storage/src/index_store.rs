//! Persisted index entries and per-(store, index) checkpoints.
//!
//! Index mutations and the checkpoint that covers them are written in one
//! SQLite transaction, so a crash never leaves a checkpoint ahead of (or
//! behind) the entries it describes.

use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use tracing::{debug, info};

use postindex_types::{
    IndexCheckpoint, IndexCommit, IndexMutation, IndexName, Position, PositionScheme,
    PostIndexEntry, PostUri, StoreName,
};

use crate::catalog::parse_timestamp;
use crate::database::{from_sql_int, to_sql_int, Database};
use crate::error::StorageError;

/// Outcome of applying one [`IndexCommit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Mutations and checkpoint were written
    Applied { mutations: usize },
    /// Nothing to write: no mutations and the checkpoint did not advance
    Unchanged,
}

/// Rows removed by [`SqliteIndexStore::rebuild_batch`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResetSummary {
    pub checkpoints: usize,
    pub entries: usize,
}

/// SQLite-backed index state
#[derive(Clone)]
pub struct SqliteIndexStore {
    db: Database,
}

struct CheckpointRow {
    store: String,
    index: String,
    version: i64,
    last_position: i64,
    scheme: String,
    event_count: i64,
    updated_at: String,
}

const SELECT_CHECKPOINT: &str = "SELECT store, index_name, version, last_position, scheme, \
     event_count, updated_at FROM index_checkpoints";

impl CheckpointRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            store: row.get(0)?,
            index: row.get(1)?,
            version: row.get(2)?,
            last_position: row.get(3)?,
            scheme: row.get(4)?,
            event_count: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_checkpoint(self) -> Result<IndexCheckpoint, StorageError> {
        let scheme = PositionScheme::parse(&self.scheme).ok_or_else(|| {
            StorageError::Serialization(format!("unknown position scheme '{}'", self.scheme))
        })?;
        let version = u32::try_from(self.version)
            .map_err(|_| StorageError::Serialization(format!("bad version {}", self.version)))?;

        Ok(IndexCheckpoint {
            store: StoreName::parse(&self.store)?,
            index: IndexName::parse(&self.index)?,
            version,
            last_position: Position::new(from_sql_int(self.last_position)?),
            scheme,
            event_count: from_sql_int(self.event_count)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

fn load_checkpoint_in(
    conn: &rusqlite::Connection,
    store: &StoreName,
    index: IndexName,
) -> Result<Option<IndexCheckpoint>, StorageError> {
    let row = conn
        .query_row(
            &format!("{} WHERE store = ?1 AND index_name = ?2", SELECT_CHECKPOINT),
            params![store.as_str(), index.as_str()],
            CheckpointRow::read,
        )
        .optional()?;
    row.map(CheckpointRow::into_checkpoint).transpose()
}

fn apply_commit(tx: &Transaction<'_>, commit: &IndexCommit) -> Result<CommitOutcome, StorageError> {
    let checkpoint = &commit.checkpoint;
    let current = load_checkpoint_in(tx, &checkpoint.store, checkpoint.index)?
        .map(|cp| cp.last_position)
        .unwrap_or(Position::ZERO);

    if checkpoint.last_position <= current {
        if commit.mutations.is_empty() {
            return Ok(CommitOutcome::Unchanged);
        }
        return Err(StorageError::OutOfOrderCheckpoint {
            store: checkpoint.store.clone(),
            index: checkpoint.index,
            current,
            attempted: checkpoint.last_position,
        });
    }

    for mutation in &commit.mutations {
        if mutation.index() != checkpoint.index {
            return Err(StorageError::Key(format!(
                "mutation for index '{}' in commit for '{}'",
                mutation.index(),
                checkpoint.index
            )));
        }
        apply_mutation(tx, &checkpoint.store, mutation)?;
    }

    tx.execute(
        "INSERT INTO index_checkpoints
            (store, index_name, version, last_position, scheme, event_count, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (store, index_name) DO UPDATE SET
            version = excluded.version,
            last_position = excluded.last_position,
            scheme = excluded.scheme,
            event_count = excluded.event_count,
            updated_at = excluded.updated_at",
        params![
            checkpoint.store.as_str(),
            checkpoint.index.as_str(),
            i64::from(checkpoint.version),
            to_sql_int(checkpoint.last_position.value())?,
            checkpoint.scheme.as_str(),
            to_sql_int(checkpoint.event_count)?,
            checkpoint.updated_at.to_rfc3339(),
        ],
    )?;

    Ok(CommitOutcome::Applied {
        mutations: commit.mutations.len(),
    })
}

fn apply_mutation(
    tx: &Transaction<'_>,
    store: &StoreName,
    mutation: &IndexMutation,
) -> Result<(), StorageError> {
    let index = mutation.index().as_str();
    let uri = mutation.uri().as_str();

    tx.execute(
        "DELETE FROM index_keys WHERE store = ?1 AND index_name = ?2 AND uri = ?3",
        params![store.as_str(), index, uri],
    )?;

    match mutation {
        IndexMutation::Upsert { keys, entry, .. } => {
            tx.execute(
                "INSERT INTO index_entries (store, index_name, uri, entry) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (store, index_name, uri) DO UPDATE SET entry = excluded.entry",
                params![store.as_str(), index, uri, serde_json::to_string(entry)?],
            )?;
            let mut insert = tx.prepare_cached(
                "INSERT OR IGNORE INTO index_keys (store, index_name, key, uri)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for key in keys {
                insert.execute(params![store.as_str(), index, key, uri])?;
            }
        }
        IndexMutation::Remove { .. } => {
            tx.execute(
                "DELETE FROM index_entries WHERE store = ?1 AND index_name = ?2 AND uri = ?3",
                params![store.as_str(), index, uri],
            )?;
        }
    }
    Ok(())
}

fn reset_in(tx: &Transaction<'_>, store: &StoreName) -> Result<ResetSummary, StorageError> {
    tx.execute("DELETE FROM index_keys WHERE store = ?1", params![store.as_str()])?;
    let entries = tx.execute("DELETE FROM index_entries WHERE store = ?1", params![store.as_str()])?;
    let checkpoints = tx.execute(
        "DELETE FROM index_checkpoints WHERE store = ?1",
        params![store.as_str()],
    )?;
    Ok(ResetSummary {
        checkpoints,
        entries,
    })
}

impl SqliteIndexStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Persisted checkpoint, or None if the index was never committed.
    pub fn load_checkpoint(
        &self,
        store: &StoreName,
        index: IndexName,
    ) -> Result<Option<IndexCheckpoint>, StorageError> {
        self.db.with_conn(|conn| load_checkpoint_in(conn, store, index))
    }

    /// All checkpoints for a store, ordered by index name
    pub fn list_checkpoints(&self, store: &StoreName) -> Result<Vec<IndexCheckpoint>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE store = ?1 ORDER BY index_name",
                SELECT_CHECKPOINT
            ))?;
            let rows = stmt
                .query_map(params![store.as_str()], CheckpointRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(CheckpointRow::into_checkpoint).collect()
        })
    }

    /// Apply several commits in a single transaction.
    ///
    /// Either every commit is applied or none is. A commit whose checkpoint
    /// does not advance fails with [`StorageError::OutOfOrderCheckpoint`]
    /// when it carries mutations and is skipped otherwise.
    pub fn commit_batch(&self, commits: &[IndexCommit]) -> Result<Vec<CommitOutcome>, StorageError> {
        let outcomes = self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let outcomes = commits
                .iter()
                .map(|commit| apply_commit(&tx, commit))
                .collect::<Result<Vec<_>, _>>()?;
            tx.commit()?;
            Ok(outcomes)
        })?;

        debug!(commits = commits.len(), "Committed index batch");
        Ok(outcomes)
    }

    /// Reset a store and apply `commits` in the same transaction.
    ///
    /// Until this commits, readers keep seeing the store's previous index
    /// state and checkpoints. With no commits it is a plain reset.
    pub fn rebuild_batch(
        &self,
        store: &StoreName,
        commits: &[IndexCommit],
    ) -> Result<(ResetSummary, Vec<CommitOutcome>), StorageError> {
        let (summary, outcomes) = self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let summary = reset_in(&tx, store)?;
            let outcomes = commits
                .iter()
                .map(|commit| apply_commit(&tx, commit))
                .collect::<Result<Vec<_>, _>>()?;
            tx.commit()?;
            Ok((summary, outcomes))
        })?;

        info!(
            store = %store,
            dropped_checkpoints = summary.checkpoints,
            dropped_entries = summary.entries,
            commits = commits.len(),
            "Rebuilt index state"
        );
        Ok((summary, outcomes))
    }

    /// Entries reachable under `key`, ordered by uri
    pub fn entries_for_key(
        &self,
        store: &StoreName,
        index: IndexName,
        key: &str,
    ) -> Result<Vec<PostIndexEntry>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT e.entry FROM index_keys k
                 JOIN index_entries e
                   ON e.store = k.store AND e.index_name = k.index_name AND e.uri = k.uri
                 WHERE k.store = ?1 AND k.index_name = ?2 AND k.key = ?3
                 ORDER BY k.uri",
            )?;
            let rows = stmt
                .query_map(params![store.as_str(), index.as_str(), key], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.iter()
                .map(|json| serde_json::from_str(json).map_err(StorageError::from))
                .collect()
        })
    }

    /// The live entry for `uri`, if any
    pub fn get_entry(
        &self,
        store: &StoreName,
        index: IndexName,
        uri: &PostUri,
    ) -> Result<Option<PostIndexEntry>, StorageError> {
        self.db.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT entry FROM index_entries
                     WHERE store = ?1 AND index_name = ?2 AND uri = ?3",
                    params![store.as_str(), index.as_str(), uri.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            json.map(|json| serde_json::from_str(&json).map_err(StorageError::from))
                .transpose()
        })
    }

    /// Keys an entry is reachable under
    pub fn keys_for_uri(
        &self,
        store: &StoreName,
        index: IndexName,
        uri: &PostUri,
    ) -> Result<BTreeSet<String>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM index_keys WHERE store = ?1 AND index_name = ?2 AND uri = ?3",
            )?;
            let keys = stmt
                .query_map(params![store.as_str(), index.as_str(), uri.as_str()], |row| {
                    row.get::<_, String>(0)
                })?
                .collect::<Result<BTreeSet<_>, _>>()?;
            Ok(keys)
        })
    }

    /// Number of live entries in an index
    pub fn entry_count(&self, store: &StoreName, index: IndexName) -> Result<u64, StorageError> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM index_entries WHERE store = ?1 AND index_name = ?2",
                params![store.as_str(), index.as_str()],
                |row| row.get(0),
            )?;
            from_sql_int(count)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use postindex_types::{Handle, Hashtag, PostPayload};

    fn store() -> StoreName {
        StoreName::parse("news").unwrap()
    }

    fn index_store() -> SqliteIndexStore {
        SqliteIndexStore::new(Database::open_in_memory().unwrap())
    }

    fn entry(n: u32, tags: &[&str]) -> PostIndexEntry {
        let event = PostPayload::new(
            PostUri::parse(&format!("at://bob.example.com/app.bsky.feed.post/{}", n)).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        )
        .with_hashtags(tags.iter().map(|t| Hashtag::parse(t).unwrap()))
        .with_author(Handle::parse("bob.example.com").unwrap())
        .at(Position::new(u64::from(n)));
        PostIndexEntry::from_event(&event)
    }

    fn upsert(entry: PostIndexEntry) -> IndexMutation {
        IndexMutation::Upsert {
            index: IndexName::Hashtag,
            keys: entry.hashtags.iter().map(|t| t.to_string()).collect(),
            entry,
        }
    }

    fn commit_at(position: u64, mutations: Vec<IndexMutation>) -> IndexCommit {
        let checkpoint = IndexCheckpoint::new(store(), IndexName::Hashtag).advanced(
            Position::new(position),
            PositionScheme::Sequence,
            mutations.len() as u64,
        );
        IndexCommit::new(checkpoint, mutations)
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let index_store = index_store();
        assert!(index_store
            .load_checkpoint(&store(), IndexName::Hashtag)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_commit_writes_entries_and_checkpoint() {
        let index_store = index_store();
        let outcomes = index_store
            .commit_batch(&[commit_at(
                2,
                vec![upsert(entry(1, &["rust", "db"])), upsert(entry(2, &["rust"]))],
            )])
            .unwrap();
        assert_eq!(outcomes, vec![CommitOutcome::Applied { mutations: 2 }]);

        let rust = index_store
            .entries_for_key(&store(), IndexName::Hashtag, "rust")
            .unwrap();
        assert_eq!(rust.len(), 2);
        assert_eq!(
            index_store
                .entries_for_key(&store(), IndexName::Hashtag, "db")
                .unwrap()
                .len(),
            1
        );

        let checkpoint = index_store
            .load_checkpoint(&store(), IndexName::Hashtag)
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_position, Position::new(2));
        assert_eq!(checkpoint.scheme, PositionScheme::Sequence);
    }

    #[test]
    fn test_upsert_replaces_keys() {
        let index_store = index_store();
        index_store
            .commit_batch(&[commit_at(1, vec![upsert(entry(1, &["old"]))])])
            .unwrap();
        index_store
            .commit_batch(&[commit_at(2, vec![upsert(entry(1, &["new"]))])])
            .unwrap();

        let uri = entry(1, &[]).uri;
        assert!(index_store
            .entries_for_key(&store(), IndexName::Hashtag, "old")
            .unwrap()
            .is_empty());
        assert_eq!(
            index_store
                .keys_for_uri(&store(), IndexName::Hashtag, &uri)
                .unwrap(),
            BTreeSet::from(["new".to_string()])
        );
        assert_eq!(index_store.entry_count(&store(), IndexName::Hashtag).unwrap(), 1);
    }

    #[test]
    fn test_remove_drops_entry_and_keys() {
        let index_store = index_store();
        let e = entry(1, &["rust"]);
        index_store
            .commit_batch(&[commit_at(1, vec![upsert(e.clone())])])
            .unwrap();
        index_store
            .commit_batch(&[commit_at(
                2,
                vec![IndexMutation::Remove {
                    index: IndexName::Hashtag,
                    uri: e.uri.clone(),
                }],
            )])
            .unwrap();

        assert!(index_store
            .get_entry(&store(), IndexName::Hashtag, &e.uri)
            .unwrap()
            .is_none());
        assert!(index_store
            .keys_for_uri(&store(), IndexName::Hashtag, &e.uri)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_out_of_order_commit_rolls_back() {
        let index_store = index_store();
        index_store
            .commit_batch(&[commit_at(10, vec![upsert(entry(1, &["a"]))])])
            .unwrap();

        let result = index_store.commit_batch(&[commit_at(7, vec![upsert(entry(2, &["b"]))])]);
        assert!(matches!(
            result,
            Err(StorageError::OutOfOrderCheckpoint { current, attempted, .. })
                if current == Position::new(10) && attempted == Position::new(7)
        ));

        assert!(index_store
            .entries_for_key(&store(), IndexName::Hashtag, "b")
            .unwrap()
            .is_empty());
        let checkpoint = index_store
            .load_checkpoint(&store(), IndexName::Hashtag)
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_position, Position::new(10));
    }

    #[test]
    fn test_empty_non_advancing_commit_is_noop() {
        let index_store = index_store();
        index_store
            .commit_batch(&[commit_at(5, vec![upsert(entry(1, &["a"]))])])
            .unwrap();
        let outcomes = index_store.commit_batch(&[commit_at(5, vec![])]).unwrap();
        assert_eq!(outcomes, vec![CommitOutcome::Unchanged]);
        let outcomes = index_store.commit_batch(&[commit_at(3, vec![])]).unwrap();
        assert_eq!(outcomes, vec![CommitOutcome::Unchanged]);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let index_store = index_store();
        index_store
            .commit_batch(&[commit_at(4, vec![upsert(entry(1, &["a"]))])])
            .unwrap();

        let author_entry = entry(9, &[]);
        let author_commit = IndexCommit::new(
            IndexCheckpoint::new(store(), IndexName::Author).advanced(
                Position::new(9),
                PositionScheme::Sequence,
                1,
            ),
            vec![IndexMutation::Upsert {
                index: IndexName::Author,
                keys: BTreeSet::from(["bob.example.com".to_string()]),
                entry: author_entry,
            }],
        );
        let stale_hashtag = commit_at(2, vec![upsert(entry(2, &["b"]))]);

        assert!(index_store
            .commit_batch(&[author_commit, stale_hashtag])
            .is_err());
        assert!(index_store
            .load_checkpoint(&store(), IndexName::Author)
            .unwrap()
            .is_none());
        assert_eq!(index_store.entry_count(&store(), IndexName::Author).unwrap(), 0);
    }

    #[test]
    fn test_reset_clears_only_one_store() {
        let index_store = index_store();
        index_store
            .commit_batch(&[commit_at(1, vec![upsert(entry(1, &["a"]))])])
            .unwrap();

        let other = StoreName::parse("other").unwrap();
        let other_commit = IndexCommit::new(
            IndexCheckpoint::new(other.clone(), IndexName::Hashtag).advanced(
                Position::new(1),
                PositionScheme::Sequence,
                1,
            ),
            vec![upsert(entry(1, &["a"]))],
        );
        index_store.commit_batch(&[other_commit]).unwrap();

        let (summary, outcomes) = index_store.rebuild_batch(&store(), &[]).unwrap();
        assert!(outcomes.is_empty());
        assert_eq!(summary, ResetSummary { checkpoints: 1, entries: 1 });
        assert!(index_store.list_checkpoints(&store()).unwrap().is_empty());
        assert_eq!(index_store.list_checkpoints(&other).unwrap().len(), 1);
        assert_eq!(index_store.entry_count(&other, IndexName::Hashtag).unwrap(), 1);
    }

    #[test]
    fn test_rebuild_replaces_state_in_one_transaction() {
        let index_store = index_store();
        index_store
            .commit_batch(&[commit_at(5, vec![upsert(entry(5, &["old"]))])])
            .unwrap();

        let (summary, outcomes) = index_store
            .rebuild_batch(&store(), &[commit_at(2, vec![upsert(entry(1, &["new"]))])])
            .unwrap();

        assert_eq!(summary, ResetSummary { checkpoints: 1, entries: 1 });
        assert_eq!(outcomes, vec![CommitOutcome::Applied { mutations: 1 }]);
        let checkpoint = index_store
            .load_checkpoint(&store(), IndexName::Hashtag)
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_position, Position::new(2));
        assert!(index_store
            .entries_for_key(&store(), IndexName::Hashtag, "old")
            .unwrap()
            .is_empty());
        assert_eq!(
            index_store
                .entries_for_key(&store(), IndexName::Hashtag, "new")
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_state() {
        let index_store = index_store();
        index_store
            .commit_batch(&[commit_at(5, vec![upsert(entry(5, &["old"]))])])
            .unwrap();

        // Same index twice: the second commit does not advance past the first
        let result = index_store.rebuild_batch(
            &store(),
            &[
                commit_at(3, vec![upsert(entry(3, &["new"]))]),
                commit_at(2, vec![upsert(entry(2, &["new"]))]),
            ],
        );

        assert!(matches!(
            result,
            Err(StorageError::OutOfOrderCheckpoint { .. })
        ));
        let checkpoint = index_store
            .load_checkpoint(&store(), IndexName::Hashtag)
            .unwrap()
            .unwrap();
        assert_eq!(checkpoint.last_position, Position::new(5));
        assert_eq!(
            index_store
                .entries_for_key(&store(), IndexName::Hashtag, "old")
                .unwrap()
                .len(),
            1
        );
    }
}
