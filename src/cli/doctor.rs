//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};

use convostore::config::AppConfig;
use convostore::db::{self, migrations, schema};

use super::format_bytes;

/// Run database diagnostics and print a health report.
///
/// Opens the file directly without migrating it, so a database that is
/// behind the current schema is reported as such rather than upgraded.
pub fn doctor(config: &AppConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `convostore migrate up` or `convostore serve` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let conn = db::open_connection(&db_path).context("failed to open database (may be corrupt)")?;
    let status = migrations::migration_status(&conn, &schema::migrations())
        .context("failed to read schema version")?;

    println!("convostore Health Report");
    println!("========================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!(
        "Schema version:    {} (latest {})",
        status.current_version, status.latest_version
    );
    if !status.pending.is_empty() {
        println!("  WARNING: {} pending migration(s). Run `convostore migrate up`.", status.pending.len());
        return Ok(());
    }

    let report = db::check_database_health(&conn).context("failed to run health check")?;

    println!("Journal mode:      {}", report.journal_mode);
    println!();
    println!("Row counts:");
    println!("  Conversations:   {}", report.conversation_count);
    println!("  Messages:        {}", report.message_count);
    println!("  Context cache:   {}", report.cache_entry_count);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED ({})", report.integrity_details);
        println!();
        println!("Recovery steps:");
        println!("  1. Stop every process using the database.");
        println!("  2. Restore from a backup: cp backup.db {}", db_path.display());
        println!("  3. Or salvage with: sqlite3 {} \".recover\" | sqlite3 recovered.db", db_path.display());
    }

    Ok(())
}
