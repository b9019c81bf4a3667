//! Shared SQLite connection for the catalog and index state.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::error::StorageError;
use crate::migrations;

/// Busy timeout for cross-process writers
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle to the catalog database. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) the database file and bring its schema up to date.
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        info!("Opening catalog database at {:?}", path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        Self::configure_connection(&conn)?;
        Self::initialize(conn, Some(path.to_path_buf()))
    }

    /// Private in-memory database, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::initialize(conn, None)
    }

    fn configure_connection(conn: &Connection) -> Result<(), StorageError> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.query_row("PRAGMA journal_mode=WAL;", [], |_| Ok(()))?;
        // Committed checkpoints must survive power loss, not just a crash
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(())
    }

    fn initialize(mut conn: Connection, path: Option<PathBuf>) -> Result<Self, StorageError> {
        let applied = migrations::run(&mut conn)?;
        if !applied.is_empty() {
            info!(migrations = ?applied, "Applied catalog migrations");
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    /// Database file path (None for in-memory)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self.conn.lock().map_err(|_| StorageError::LockPoisoned)?;
        f(&mut conn)
    }
}

/// Convert a u64 counter to SQLite's signed integer.
pub(crate) fn to_sql_int(value: u64) -> Result<i64, StorageError> {
    i64::try_from(value).map_err(|_| StorageError::Key(format!("value {} exceeds i64", value)))
}

/// Convert a stored signed integer back to u64.
pub(crate) fn from_sql_int(value: i64) -> Result<u64, StorageError> {
    u64::try_from(value)
        .map_err(|_| StorageError::Serialization(format!("negative stored value {}", value)))
}
