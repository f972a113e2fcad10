//! Table-backed repositories over [`crate::store::Store`].
//!
//! A [`Repository`] names its table, its column list and how to map a row.
//! The provided helpers go through `prepare_cached`, so each statement shape
//! is prepared once per connection.

pub mod cache;

pub use cache::{CacheEntry, CachePayload, CacheRepository, CacheRepositoryStats, CleanupResult};

use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

pub trait Repository {
    type Entity;

    const TABLE: &'static str;

    /// Comma-separated column list used by the `find_*` helpers.
    const COLUMNS: &'static str;

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self::Entity>;

    fn count(conn: &Connection) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", Self::TABLE);
        let n: i64 = conn.prepare_cached(&sql)?.query_row([], |row| row.get(0))?;
        Ok(n as u64)
    }

    fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self::Entity>> {
        let sql = format!("SELECT {} FROM {} WHERE id = ?1", Self::COLUMNS, Self::TABLE);
        let found = conn
            .prepare_cached(&sql)?
            .query_row([id], Self::map_row)
            .optional()?;
        Ok(found)
    }

    fn delete_by_id(conn: &Connection, id: &str) -> Result<bool> {
        let sql = format!("DELETE FROM {} WHERE id = ?1", Self::TABLE);
        let deleted = conn.prepare_cached(&sql)?.execute([id])?;
        Ok(deleted > 0)
    }

    /// Run a `SELECT {COLUMNS} FROM {TABLE} ...` built by the caller and map every row.
    fn find_where<P: rusqlite::Params>(conn: &Connection, tail: &str, params: P) -> Result<Vec<Self::Entity>> {
        let sql = format!("SELECT {} FROM {} {}", Self::COLUMNS, Self::TABLE, tail);
        let mut stmt = conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(params, Self::map_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
