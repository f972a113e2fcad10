//! CLI `migrate` commands: show status, apply pending migrations, roll back.

use anyhow::{Context, Result};

use convostore::config::AppConfig;
use convostore::db::migrations::{self, MigrationResult};
use convostore::db::{self, schema};
use convostore::StorageError;

fn open(config: &AppConfig) -> Result<rusqlite::Connection> {
    let db_path = config.resolved_db_path();
    db::open_connection(&db_path).with_context(|| format!("failed to open database at {}", db_path.display()))
}

fn print_results(results: &[MigrationResult]) {
    for r in results {
        println!(
            "  v{:<3} {:<45} {:>6} ms  {}",
            r.version,
            r.description,
            r.duration.as_millis(),
            if r.success { "ok" } else { "FAILED" }
        );
        if let Some(ref err) = r.error {
            println!("        {err}");
        }
    }
}

/// Print what a failed run got through before handing the error back.
fn report_failure(err: StorageError) -> StorageError {
    if let StorageError::MigrationFailed { ref results, .. } = err {
        print_results(results);
    }
    err
}

/// Print the current and latest schema versions and every pending migration.
pub fn status(config: &AppConfig) -> Result<()> {
    let conn = open(config)?;
    let set = schema::migrations();
    let status = migrations::migration_status(&conn, &set)?;

    println!("Current version:   {}", status.current_version);
    println!("Latest version:    {}", status.latest_version);
    if status.pending.is_empty() {
        println!("Schema is up to date.");
    } else {
        println!("Pending:");
        for m in set.iter().filter(|m| status.pending.contains(&m.version)) {
            println!("  v{:<3} {}", m.version, m.description);
        }
    }
    Ok(())
}

/// Apply every pending migration.
pub fn up(config: &AppConfig) -> Result<()> {
    let mut conn = open(config)?;
    let results = migrations::run_migrations(&mut conn, &schema::migrations())
        .map_err(report_failure)
        .context("migration failed")?;

    if results.is_empty() {
        println!("Schema is up to date (version {}).", migrations::current_version(&conn)?);
    } else {
        println!("Applied {} migration(s):", results.len());
        print_results(&results);
    }
    Ok(())
}

/// Roll back to `target`, running each `down` in descending order.
pub fn down(config: &AppConfig, target: u32) -> Result<()> {
    let mut conn = open(config)?;
    let results = migrations::rollback_to_version(&mut conn, target, &schema::migrations())
        .map_err(report_failure)
        .with_context(|| format!("rollback to version {target} failed"))?;

    println!("Rolled back {} migration(s):", results.len());
    print_results(&results);
    println!("Schema version is now {}.", migrations::current_version(&conn)?);
    Ok(())
}
