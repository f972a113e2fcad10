//! Typed errors for the storage core.
//!
//! Every fallible operation in [`crate::db`], [`crate::query`], [`crate::store`]
//! and [`crate::repository`] returns [`StorageError`]. Raw `rusqlite` errors are
//! converted through [`From`], which recognises constraint violations and maps
//! them to [`StorageError::Constraint`] so collaborators never have to inspect
//! SQLite extended result codes themselves.

use rusqlite::ffi;
use thiserror::Error;

use crate::db::migrations::MigrationResult;

/// Result alias used throughout the storage core.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Category of a violated SQLite constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    PrimaryKey,
    ForeignKey,
    Check,
    NotNull,
}

impl ConstraintKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unique => "unique",
            Self::PrimaryKey => "primary key",
            Self::ForeignKey => "foreign key",
            Self::Check => "check",
            Self::NotNull => "not null",
        }
    }

    /// Map a SQLite extended result code to a constraint category.
    fn from_extended_code(code: i32) -> Option<Self> {
        match code {
            ffi::SQLITE_CONSTRAINT_UNIQUE => Some(Self::Unique),
            ffi::SQLITE_CONSTRAINT_PRIMARYKEY => Some(Self::PrimaryKey),
            ffi::SQLITE_CONSTRAINT_FOREIGNKEY => Some(Self::ForeignKey),
            ffi::SQLITE_CONSTRAINT_CHECK => Some(Self::Check),
            ffi::SQLITE_CONSTRAINT_NOTNULL => Some(Self::NotNull),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("timed out after {waited_ms}ms waiting for a pooled connection")]
    AcquireTimeout { waited_ms: u64 },

    #[error("connection pool is shutting down")]
    PoolShutdown,

    #[error("invalid pool configuration: {0}")]
    InvalidPoolConfig(String),

    #[error("invalid migration set: {0}")]
    InvalidMigrations(String),

    /// `results` holds every migration attempted in the run, ending with the
    /// failed one.
    #[error("migration {version} ({description}) failed: {source}")]
    MigrationFailed {
        version: u32,
        description: String,
        #[source]
        source: rusqlite::Error,
        results: Vec<MigrationResult>,
    },

    #[error("migration {version} ({description}) has no down statements and cannot be rolled back")]
    MissingDown { version: u32, description: String },

    #[error("migration {0} is applied but not defined")]
    MissingMigration(u32),

    #[error("cannot roll back to version {target}: current version is {current}")]
    InvalidRollbackTarget { target: u32, current: u32 },

    #[error("{kind} constraint violated: {message}")]
    Constraint { kind: ConstraintKind, message: String },

    #[error("invalid SQL identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("bulk insert into {table} failed after {inserted} rows: {source}")]
    BulkInsert {
        table: String,
        inserted: usize,
        #[source]
        source: rusqlite::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode row: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),

    #[error("blocking task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Sqlite(rusqlite::Error),
}

impl StorageError {
    /// `true` for errors a caller may reasonably retry (timeouts, busy database).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AcquireTimeout { .. } => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, ref message) = err {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                if let Some(kind) = ConstraintKind::from_extended_code(failure.extended_code) {
                    return Self::Constraint {
                        kind,
                        message: message.clone().unwrap_or_else(|| failure.to_string()),
                    };
                }
            }
        }
        Self::Sqlite(err)
    }
}

impl From<tokio::task::JoinError> for StorageError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn conn_with_tables() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "foreign_keys", "ON").unwrap();
        conn.execute_batch(
            "CREATE TABLE parent (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
             CREATE TABLE child (
                 id INTEGER PRIMARY KEY,
                 parent_id INTEGER NOT NULL REFERENCES parent(id),
                 score INTEGER CHECK(score >= 0)
             );
             INSERT INTO parent (id, name) VALUES (1, 'a');",
        )
        .unwrap();
        conn
    }

    fn kind_of(err: rusqlite::Error) -> Option<ConstraintKind> {
        match StorageError::from(err) {
            StorageError::Constraint { kind, .. } => Some(kind),
            _ => None,
        }
    }

    #[test]
    fn unique_violation_is_classified() {
        let conn = conn_with_tables();
        let err = conn
            .execute("INSERT INTO parent (id, name) VALUES (2, 'a')", [])
            .unwrap_err();
        assert_eq!(kind_of(err), Some(ConstraintKind::Unique));
    }

    #[test]
    fn primary_key_violation_is_classified() {
        let conn = conn_with_tables();
        let err = conn
            .execute("INSERT INTO parent (id, name) VALUES (1, 'b')", [])
            .unwrap_err();
        assert_eq!(kind_of(err), Some(ConstraintKind::PrimaryKey));
    }

    #[test]
    fn foreign_key_violation_is_classified() {
        let conn = conn_with_tables();
        let err = conn
            .execute("INSERT INTO child (parent_id, score) VALUES (99, 1)", [])
            .unwrap_err();
        assert_eq!(kind_of(err), Some(ConstraintKind::ForeignKey));
    }

    #[test]
    fn check_and_not_null_violations_are_classified() {
        let conn = conn_with_tables();
        let err = conn
            .execute("INSERT INTO child (parent_id, score) VALUES (1, -1)", [])
            .unwrap_err();
        assert_eq!(kind_of(err), Some(ConstraintKind::Check));

        let err = conn
            .execute("INSERT INTO parent (id, name) VALUES (3, NULL)", [])
            .unwrap_err();
        assert_eq!(kind_of(err), Some(ConstraintKind::NotNull));
    }

    #[test]
    fn other_errors_pass_through() {
        let conn = conn_with_tables();
        let err = conn.execute("SELECT * FROM missing_table", []).unwrap_err();
        assert!(matches!(StorageError::from(err), StorageError::Sqlite(_)));
    }

    #[test]
    fn timeout_is_transient() {
        assert!(StorageError::AcquireTimeout { waited_ms: 30_000 }.is_transient());
        assert!(!StorageError::PoolShutdown.is_transient());
    }
}
