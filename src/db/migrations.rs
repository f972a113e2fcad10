//! Versioned, transactional schema migrations.
//!
//! The schema version lives in `persistence_state` under [`SCHEMA_VERSION_KEY`].
//! Each migration runs in its own transaction together with its version bump,
//! so a failure can never leave a half-applied migration or a version that
//! disagrees with the schema. Rollbacks mirror this with the `down` statements.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::error::{Result, StorageError};

/// Key under which the schema version is stored in `persistence_state`.
pub const SCHEMA_VERSION_KEY: &str = "schema_version";

const STATE_TABLE_SQL: &str = "CREATE TABLE IF NOT EXISTS persistence_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER NOT NULL
)";

/// A versioned schema change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    /// Position in the contiguous sequence 1..N.
    pub version: u32,
    pub description: String,
    /// Forward statements, executed in order.
    pub up: Vec<String>,
    /// Reverse statements, executed in order. `None` makes the migration irreversible.
    pub down: Option<Vec<String>>,
    /// Reserved; the runner does not consult it.
    pub requires_special_handling: bool,
}

impl Migration {
    pub fn new(version: u32, description: impl Into<String>, up: &[&str]) -> Self {
        Self {
            version,
            description: description.into(),
            up: up.iter().map(|s| s.to_string()).collect(),
            down: None,
            requires_special_handling: false,
        }
    }

    pub fn with_down(mut self, down: &[&str]) -> Self {
        self.down = Some(down.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn with_special_handling(mut self) -> Self {
        self.requires_special_handling = true;
        self
    }
}

/// Outcome of applying or rolling back one migration.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub version: u32,
    pub description: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_ms")]
    pub duration: Duration,
}

impl MigrationResult {
    fn failed(migration: &Migration, err: &rusqlite::Error, duration: Duration) -> Self {
        Self {
            version: migration.version,
            description: migration.description.clone(),
            success: false,
            error: Some(err.to_string()),
            duration,
        }
    }
}

/// Snapshot of where the database stands relative to a migration set.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationStatus {
    pub current_version: u32,
    pub latest_version: u32,
    pub pending: Vec<u32>,
}

mod duration_ms {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// Create `persistence_state` if needed and seed the version key with 0.
pub fn ensure_state_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute(STATE_TABLE_SQL, [])?;
    conn.execute(
        "INSERT OR IGNORE INTO persistence_state (key, value, updated_at) VALUES (?1, '0', ?2)",
        params![SCHEMA_VERSION_KEY, now_millis()],
    )?;
    Ok(())
}

/// Read the current schema version. Always read from the table, never cached.
pub fn current_version(conn: &Connection) -> Result<u32> {
    ensure_state_table(conn)?;
    let value: Option<String> = conn
        .query_row(
            "SELECT value FROM persistence_state WHERE key = ?1",
            [SCHEMA_VERSION_KEY],
            |row| row.get(0),
        )
        .optional()?;

    match value {
        None => Ok(0),
        Some(v) => v.trim().parse::<u32>().map_err(|_| {
            StorageError::InvalidMigrations(format!("stored schema version is not an integer: {v:?}"))
        }),
    }
}

fn write_version(conn: &Connection, version: u32) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO persistence_state (key, value, updated_at) VALUES (?1, ?2, ?3) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![SCHEMA_VERSION_KEY, version.to_string(), now_millis()],
    )?;
    Ok(())
}

/// Reject duplicate versions and any set that is not exactly 1..N.
pub fn validate_migrations(migrations: &[Migration]) -> Result<()> {
    let mut seen = HashSet::new();
    for m in migrations {
        if !seen.insert(m.version) {
            return Err(StorageError::InvalidMigrations(format!(
                "duplicate migration version {}",
                m.version
            )));
        }
    }

    let mut versions: Vec<u32> = migrations.iter().map(|m| m.version).collect();
    versions.sort_unstable();
    for (idx, version) in versions.iter().enumerate() {
        let expected = idx as u32 + 1;
        if *version != expected {
            return Err(StorageError::InvalidMigrations(format!(
                "migration versions must be sequential from 1: expected {expected}, found {version}"
            )));
        }
    }
    Ok(())
}

/// Highest version defined in the set (0 when empty).
pub fn latest_version(migrations: &[Migration]) -> u32 {
    migrations.iter().map(|m| m.version).max().unwrap_or(0)
}

pub fn is_up_to_date(conn: &Connection, migrations: &[Migration]) -> Result<bool> {
    Ok(current_version(conn)? >= latest_version(migrations))
}

pub fn migration_status(conn: &Connection, migrations: &[Migration]) -> Result<MigrationStatus> {
    let current = current_version(conn)?;
    let mut pending: Vec<u32> = migrations
        .iter()
        .map(|m| m.version)
        .filter(|v| *v > current)
        .collect();
    pending.sort_unstable();
    Ok(MigrationStatus {
        current_version: current,
        latest_version: latest_version(migrations),
        pending,
    })
}

/// Apply every migration newer than the current version, in ascending order.
///
/// Stops at the first failure: that migration is rolled back in full and the
/// error names it. Migrations committed earlier in the same run stay applied.
pub fn run_migrations(conn: &mut Connection, migrations: &[Migration]) -> Result<Vec<MigrationResult>> {
    validate_migrations(migrations)?;

    let current = current_version(conn)?;
    let mut pending: Vec<&Migration> = migrations.iter().filter(|m| m.version > current).collect();
    pending.sort_by_key(|m| m.version);

    if pending.is_empty() {
        tracing::debug!(schema_version = current, "schema up to date");
        return Ok(Vec::new());
    }

    tracing::info!(
        from = current,
        to = latest_version(migrations),
        count = pending.len(),
        "applying migrations"
    );

    let mut results = Vec::with_capacity(pending.len());
    for migration in pending {
        let started = Instant::now();
        match apply_one(conn, migration) {
            Ok(()) => {
                let result = MigrationResult {
                    version: migration.version,
                    description: migration.description.clone(),
                    success: true,
                    error: None,
                    duration: started.elapsed(),
                };
                tracing::info!(
                    version = result.version,
                    description = %result.description,
                    duration_ms = result.duration.as_millis() as u64,
                    "migration applied"
                );
                results.push(result);
            }
            Err(source) => {
                tracing::error!(
                    version = migration.version,
                    description = %migration.description,
                    error = %source,
                    "migration failed; rolled back"
                );
                results.push(MigrationResult::failed(migration, &source, started.elapsed()));
                return Err(StorageError::MigrationFailed {
                    version: migration.version,
                    description: migration.description.clone(),
                    source,
                    results,
                });
            }
        }
    }

    Ok(results)
}

fn apply_one(conn: &mut Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    for statement in &migration.up {
        tx.execute_batch(statement)?;
    }
    write_version(&tx, migration.version)?;
    tx.commit()
}

/// Roll back to `target`, undoing migrations in descending order.
///
/// Every migration in `(target, current]` must be defined and carry `down`
/// statements; this is checked before any SQL runs.
pub fn rollback_to_version(
    conn: &mut Connection,
    target: u32,
    migrations: &[Migration],
) -> Result<Vec<MigrationResult>> {
    validate_migrations(migrations)?;

    let current = current_version(conn)?;
    if target >= current {
        return Err(StorageError::InvalidRollbackTarget { target, current });
    }

    let mut plan: Vec<(&Migration, &[String])> = Vec::new();
    for version in ((target + 1)..=current).rev() {
        let migration = migrations
            .iter()
            .find(|m| m.version == version)
            .ok_or(StorageError::MissingMigration(version))?;
        let down = migration.down.as_deref().ok_or_else(|| StorageError::MissingDown {
            version,
            description: migration.description.clone(),
        })?;
        plan.push((migration, down));
    }

    tracing::info!(from = current, to = target, count = plan.len(), "rolling back migrations");

    let mut results = Vec::with_capacity(plan.len());
    for (migration, down) in plan {
        let started = Instant::now();
        let outcome = (|| -> rusqlite::Result<()> {
            let tx = conn.transaction()?;
            for statement in down {
                tx.execute_batch(statement)?;
            }
            write_version(&tx, migration.version - 1)?;
            tx.commit()
        })();

        if let Err(source) = outcome {
            tracing::error!(version = migration.version, error = %source, "rollback failed");
            results.push(MigrationResult::failed(migration, &source, started.elapsed()));
            return Err(StorageError::MigrationFailed {
                version: migration.version,
                description: migration.description.clone(),
                source,
                results,
            });
        }

        tracing::info!(version = migration.version, "migration rolled back");
        results.push(MigrationResult {
            version: migration.version,
            description: migration.description.clone(),
            success: true,
            error: None,
            duration: started.elapsed(),
        });
    }

    Ok(results)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
