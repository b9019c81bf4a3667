//! Store catalog: the registry of stores the indexer maintains.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::info;

use postindex_types::{Store, StoreConfig, StoreName};

use crate::database::Database;
use crate::error::StorageError;

/// Read access to registered stores.
///
/// The reconciliation engine only needs to enumerate stores and to notice
/// when one disappears; registration lives on concrete catalogs.
pub trait StoreCatalog: Send + Sync {
    /// All registered stores, ordered by name
    fn list(&self) -> Result<Vec<Store>, StorageError>;

    fn get(&self, name: &StoreName) -> Result<Option<Store>, StorageError>;

    /// Whether `name` is still registered
    fn contains(&self, name: &StoreName) -> Result<bool, StorageError> {
        Ok(self.get(name)?.is_some())
    }
}

/// SQLite-backed store catalog
#[derive(Clone)]
pub struct SqliteStoreCatalog {
    db: Database,
}

struct StoreRow {
    name: String,
    root: String,
    description: Option<String>,
    config: String,
    created_at: String,
    updated_at: String,
}

const SELECT_STORE: &str =
    "SELECT name, root, description, config_json, created_at, updated_at FROM stores";

impl StoreRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            name: row.get(0)?,
            root: row.get(1)?,
            description: row.get(2)?,
            config: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
        })
    }

    fn into_store(self) -> Result<Store, StorageError> {
        Ok(Store {
            name: StoreName::parse(&self.name)?,
            root: PathBuf::from(self.root),
            description: self.description,
            config: serde_json::from_str::<StoreConfig>(&self.config)?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid timestamp '{}': {}", value, e)))
}

fn query_store(conn: &Connection, name: &StoreName) -> Result<Option<Store>, StorageError> {
    let row = conn
        .query_row(
            &format!("{} WHERE name = ?1", SELECT_STORE),
            params![name.as_str()],
            StoreRow::read,
        )
        .optional()?;
    row.map(StoreRow::into_store).transpose()
}

impl SqliteStoreCatalog {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Register a new store. Fails if the name is taken.
    pub fn register(
        &self,
        name: StoreName,
        root: PathBuf,
        description: Option<String>,
        config: StoreConfig,
    ) -> Result<Store, StorageError> {
        let now = Utc::now();
        let store = Store {
            name,
            root,
            description,
            config,
            created_at: now,
            updated_at: now,
        };
        let config_json = serde_json::to_string(&store.config)?;

        self.db.with_conn(|conn| {
            if query_store(conn, &store.name)?.is_some() {
                return Err(StorageError::AlreadyExists(format!(
                    "store '{}'",
                    store.name
                )));
            }
            conn.execute(
                "INSERT INTO stores (name, root, description, config_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    store.name.as_str(),
                    store.root.to_string_lossy(),
                    store.description,
                    config_json,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        info!(store = %store.name, root = ?store.root, "Registered store");
        Ok(store)
    }

    /// Replace a store's configuration. Takes effect on the next run.
    pub fn update_config(&self, name: &StoreName, config: StoreConfig) -> Result<Store, StorageError> {
        let config_json = serde_json::to_string(&config)?;
        let now = Utc::now();

        self.db.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE stores SET config_json = ?1, updated_at = ?2 WHERE name = ?3",
                params![config_json, now.to_rfc3339(), name.as_str()],
            )?;
            if updated == 0 {
                return Err(StorageError::NotFound(format!("store '{}'", name)));
            }
            query_store(conn, name)?
                .ok_or_else(|| StorageError::NotFound(format!("store '{}'", name)))
        })
    }

    /// Unregister a store and drop its index state.
    ///
    /// Returns false if the store was not registered. The event log on disk
    /// is left in place.
    pub fn remove(&self, name: &StoreName) -> Result<bool, StorageError> {
        let removed = self.db.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute("DELETE FROM stores WHERE name = ?1", params![name.as_str()])?;
            for table in ["index_keys", "index_entries", "index_checkpoints"] {
                tx.execute(
                    &format!("DELETE FROM {} WHERE store = ?1", table),
                    params![name.as_str()],
                )?;
            }
            tx.commit()?;
            Ok(removed > 0)
        })?;

        if removed {
            info!(store = %name, "Removed store");
        }
        Ok(removed)
    }
}

impl StoreCatalog for SqliteStoreCatalog {
    fn list(&self) -> Result<Vec<Store>, StorageError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("{} ORDER BY name", SELECT_STORE))?;
            let rows = stmt
                .query_map([], StoreRow::read)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(StoreRow::into_store).collect()
        })
    }

    fn get(&self, name: &StoreName) -> Result<Option<Store>, StorageError> {
        self.db.with_conn(|conn| query_store(conn, name))
    }

    fn contains(&self, name: &StoreName) -> Result<bool, StorageError> {
        self.db.with_conn(|conn| {
            let found: Option<i64> = conn
                .query_row(
                    "SELECT 1 FROM stores WHERE name = ?1",
                    params![name.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
    }
}
