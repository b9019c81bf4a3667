//! Named, forward-only schema migrations for the catalog database.
//!
//! Applied migrations are recorded in `schema_migrations` so each one runs
//! exactly once. New migrations are appended to [`MIGRATIONS`]; existing
//! entries are never edited.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use crate::error::StorageError;

/// A single schema change
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    pub name: &'static str,
    pub sql: &'static str,
}

/// All migrations in application order
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        name: "001_init",
        sql: "CREATE TABLE stores (
                name TEXT PRIMARY KEY,
                root TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                config_json TEXT NOT NULL
            );",
    },
    Migration {
        name: "002_add_description",
        sql: "ALTER TABLE stores ADD COLUMN description TEXT;",
    },
    Migration {
        name: "003_index_state",
        sql: "CREATE TABLE index_checkpoints (
                store TEXT NOT NULL,
                index_name TEXT NOT NULL,
                version INTEGER NOT NULL,
                last_position INTEGER NOT NULL,
                scheme TEXT NOT NULL,
                event_count INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (store, index_name)
            );
            CREATE TABLE index_entries (
                store TEXT NOT NULL,
                index_name TEXT NOT NULL,
                uri TEXT NOT NULL,
                entry TEXT NOT NULL,
                PRIMARY KEY (store, index_name, uri)
            );
            CREATE TABLE index_keys (
                store TEXT NOT NULL,
                index_name TEXT NOT NULL,
                key TEXT NOT NULL,
                uri TEXT NOT NULL,
                PRIMARY KEY (store, index_name, key, uri)
            );
            CREATE INDEX idx_index_keys_uri ON index_keys (store, index_name, uri);",
    },
];

fn ensure_tracking_table(conn: &Connection) -> Result<(), StorageError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at TEXT NOT NULL
        )",
        [],
    )?;
    Ok(())
}

/// Names of migrations already applied, in application order.
pub fn applied(conn: &Connection) -> Result<Vec<String>, StorageError> {
    ensure_tracking_table(conn)?;
    let mut stmt = conn.prepare("SELECT name FROM schema_migrations ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Apply every pending migration, each in its own transaction.
///
/// Returns the names of the migrations applied by this call.
pub fn run(conn: &mut Connection) -> Result<Vec<&'static str>, StorageError> {
    ensure_tracking_table(conn)?;

    let mut newly_applied = Vec::new();
    for migration in MIGRATIONS {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let already: Option<String> = tx
            .query_row(
                "SELECT name FROM schema_migrations WHERE name = ?1",
                params![migration.name],
                |row| row.get(0),
            )
            .optional()?;
        if already.is_some() {
            continue;
        }

        tx.execute_batch(migration.sql)
            .map_err(|e| StorageError::Migration {
                name: migration.name.to_string(),
                reason: e.to_string(),
            })?;
        tx.execute(
            "INSERT INTO schema_migrations (name, applied_at) VALUES (?1, ?2)",
            params![migration.name, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;

        debug!(migration = migration.name, "Applied migration");
        newly_applied.push(migration.name);
    }
    Ok(newly_applied)
}
