//! Batched multi-row inserts.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

use crate::error::{Result, StorageError};

#[derive(Debug, Clone)]
pub struct BulkInsertOptions {
    pub batch_size: usize,
    /// Wrap each batch in its own transaction. Without it every row commits
    /// on its own and a failure keeps the rows before it.
    pub use_transaction: bool,
}

impl Default for BulkInsertOptions {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            use_transaction: true,
        }
    }
}

/// Accepts `[A-Za-z_][A-Za-z0-9_]*`. Table and column names are spliced into
/// SQL text, so nothing else gets through.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

fn insert_sql<C: AsRef<str>>(table: &str, columns: &[C]) -> String {
    let names: Vec<&str> = columns.iter().map(|c| c.as_ref()).collect();
    let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
    format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        names.join(", "),
        placeholders.join(", ")
    )
}

/// Insert `rows` into `table` in batches of `options.batch_size`.
///
/// Each batch reuses one cached prepared statement. When a batch fails only
/// that batch is rolled back; the error carries the number of rows committed
/// by the earlier batches.
pub fn bulk_insert<C: AsRef<str>>(
    conn: &mut Connection,
    table: &str,
    columns: &[C],
    rows: &[Vec<Value>],
    options: &BulkInsertOptions,
) -> Result<usize> {
    validate_identifier(table)?;
    if columns.is_empty() {
        return Err(StorageError::InvalidIdentifier(String::new()));
    }
    for column in columns {
        validate_identifier(column.as_ref())?;
    }
    if rows.is_empty() {
        return Ok(0);
    }

    let sql = insert_sql(table, columns);
    let batch_size = options.batch_size.max(1);
    let mut inserted = 0usize;

    for (batch_no, batch) in rows.chunks(batch_size).enumerate() {
        let outcome = if options.use_transaction {
            insert_batch_in_transaction(conn, &sql, batch)
        } else {
            insert_batch(conn, &sql, batch, &mut inserted)
        };

        match outcome {
            Ok(count) => {
                if options.use_transaction {
                    inserted += count;
                }
            }
            Err(source) => {
                tracing::warn!(table, batch = batch_no, inserted, error = %source, "bulk insert batch failed");
                return Err(StorageError::BulkInsert {
                    table: table.to_string(),
                    inserted,
                    source,
                });
            }
        }
    }

    tracing::debug!(table, inserted, batch_size, "bulk insert complete");
    Ok(inserted)
}

fn insert_batch_in_transaction(conn: &mut Connection, sql: &str, batch: &[Vec<Value>]) -> rusqlite::Result<usize> {
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare_cached(sql)?;
        for row in batch {
            stmt.execute(params_from_iter(row.iter()))?;
        }
    }
    tx.commit()?;
    Ok(batch.len())
}

fn insert_batch(conn: &Connection, sql: &str, batch: &[Vec<Value>], inserted: &mut usize) -> rusqlite::Result<usize> {
    let mut stmt = conn.prepare_cached(sql)?;
    for row in batch {
        stmt.execute(params_from_iter(row.iter()))?;
        *inserted += 1;
    }
    Ok(batch.len())
}
