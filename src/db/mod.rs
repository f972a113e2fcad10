//! SQLite connection setup, pooling, schema, and migrations.

pub mod migrations;
pub mod pool;
pub mod rows;
pub mod schema;

use rusqlite::Connection;
use serde::Serialize;
use std::path::Path;

use crate::error::Result;

/// Busy timeout applied to every connection (ms).
pub const BUSY_TIMEOUT_MS: u64 = 5_000;

/// Page cache size pragma value (negative means KiB).
const CACHE_SIZE_KIB: i64 = -64_000;

/// Memory-mapped I/O region (bytes).
const MMAP_SIZE_BYTES: i64 = 268_435_456;

/// Prepared statements kept per connection by `prepare_cached`.
const STATEMENT_CACHE_CAPACITY: usize = 64;

/// Apply the fixed pragma contract to a connection.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "cache_size", CACHE_SIZE_KIB)?;
    conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "mmap_size", MMAP_SIZE_BYTES)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
    Ok(())
}

/// Open (or create) a database file and apply the pragma contract.
///
/// The parent directory is created if missing. Schema is not touched here;
/// see [`migrations::run_migrations`].
pub fn open_connection(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    configure_connection(&conn)?;
    tracing::debug!(path = %path.display(), "connection opened");
    Ok(conn)
}

/// Database health report, produced by [`check_database_health`].
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub journal_mode: String,
    pub schema_version: u32,
    pub conversation_count: u64,
    pub message_count: u64,
    pub cache_entry_count: u64,
}

/// Run integrity and row-count checks against a migrated database.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    let schema_version = migrations::current_version(conn)?;

    Ok(HealthReport {
        integrity_ok: integrity == "ok",
        integrity_details: integrity,
        journal_mode,
        schema_version,
        conversation_count: count_rows(conn, "conversations")?,
        message_count: count_rows(conn, "messages")?,
        cache_entry_count: count_rows(conn, "context_cache")?,
    })
}

/// Row count for a table, or 0 when the table does not exist yet.
fn count_rows(conn: &Connection, table: &str) -> Result<u64> {
    let exists: bool = conn.query_row(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )?;
    if !exists {
        return Ok(0);
    }
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_applies_pragmas() {
        let tmp = TempDir::new().unwrap();
        let conn = open_connection(tmp.path().join("pragmas.db")).unwrap();

        let journal: String = conn
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");

        let fk: i64 = conn
            .pragma_query_value(None, "foreign_keys", |row| row.get(0))
            .unwrap();
        assert_eq!(fk, 1);

        let timeout: i64 = conn
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .unwrap();
        assert_eq!(timeout, BUSY_TIMEOUT_MS as i64);

        // synchronous=NORMAL is 1, temp_store=MEMORY is 2
        let sync: i64 = conn
            .pragma_query_value(None, "synchronous", |row| row.get(0))
            .unwrap();
        assert_eq!(sync, 1);
        let temp_store: i64 = conn
            .pragma_query_value(None, "temp_store", |row| row.get(0))
            .unwrap();
        assert_eq!(temp_store, 2);
    }

    #[test]
    fn open_creates_parent_directories() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("dir").join("store.db");
        open_connection(&path).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn health_check_on_unmigrated_db_reports_zero_counts() {
        let tmp = TempDir::new().unwrap();
        let conn = open_connection(tmp.path().join("health.db")).unwrap();
        let report = check_database_health(&conn).unwrap();
        assert!(report.integrity_ok);
        assert_eq!(report.schema_version, 0);
        assert_eq!(report.conversation_count, 0);
        assert_eq!(report.cache_entry_count, 0);
    }
}
