//! Persistent context cache (`context_cache` table).
//!
//! Entries carry a per-row expiry. Expired rows are invisible to reads and
//! removed by [`CacheRepository::cleanup`], which also trims the table to
//! `cache.max_entries` by evicting the least recently accessed rows.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::Repository;
use crate::config::CacheConfig;
use crate::error::Result;
use crate::store::Store;

const MS_PER_HOUR: f64 = 3_600_000.0;

/// What a caller stores under a cache key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePayload {
    pub summary_ids: Vec<String>,
    pub assembled_context: String,
    /// Estimated from the context length when absent.
    pub token_count: Option<i64>,
}

impl CachePayload {
    pub fn new(summary_ids: Vec<String>, assembled_context: impl Into<String>) -> Self {
        Self {
            summary_ids,
            assembled_context: assembled_context.into(),
            token_count: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheEntry {
    pub id: String,
    pub cache_key: String,
    pub summary_ids: Vec<String>,
    pub assembled_context: String,
    pub token_count: i64,
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: i64,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupResult {
    pub expired: usize,
    pub evicted: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheRepositoryStats {
    pub entries: u64,
    pub expired_entries: u64,
    pub total_tokens: i64,
    pub total_accesses: i64,
    pub oldest_access: Option<DateTime<Utc>>,
}

/// Rough token estimate: one token per four characters, rounded up.
pub fn estimate_tokens(text: &str) -> i64 {
    text.chars().count().div_ceil(4) as i64
}

fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Expiry timestamp for a TTL in hours. Zero or negative TTL means no expiry.
/// Huge TTLs clamp to the latest representable timestamp.
fn expiry_for(now_ms: i64, ttl_hours: f64) -> Option<i64> {
    if ttl_hours.is_finite() && ttl_hours > 0.0 {
        let ttl_ms = (ttl_hours * MS_PER_HOUR).round() as i64;
        Some(now_ms.saturating_add(ttl_ms).min(latest_ms()))
    } else {
        None
    }
}

fn latest_ms() -> i64 {
    DateTime::<Utc>::MAX_UTC.timestamp_millis()
}

const LIVE: &str = "(expires_at IS NULL OR expires_at > ?1)";

#[derive(Clone)]
pub struct CacheRepository {
    store: Store,
    config: CacheConfig,
}

impl Repository for CacheRepository {
    type Entity = CacheEntry;

    const TABLE: &'static str = "context_cache";
    const COLUMNS: &'static str = "id, cache_key, summary_ids, assembled_context, token_count, \
                                   created_at, accessed_at, access_count, expires_at";

    fn map_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
        let raw_ids: String = row.get(2)?;
        let summary_ids: Vec<String> = serde_json::from_str(&raw_ids)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?;
        Ok(CacheEntry {
            id: row.get(0)?,
            cache_key: row.get(1)?,
            summary_ids,
            assembled_context: row.get(3)?,
            token_count: row.get(4)?,
            created_at: ms_to_datetime(row.get(5)?),
            accessed_at: ms_to_datetime(row.get(6)?),
            access_count: row.get(7)?,
            expires_at: row.get::<_, Option<i64>>(8)?.map(ms_to_datetime),
        })
    }
}

impl CacheRepository {
    pub fn new(store: Store, config: CacheConfig) -> Self {
        Self { store, config }
    }

    /// Live entry for `key`. A hit bumps its access time and count.
    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let key = key.to_string();
        self.store
            .transaction(move |tx| {
                let now = Utc::now().timestamp_millis();
                let found = Self::find_where(tx, &format!("WHERE cache_key = ?2 AND {LIVE}"), params![now, key])?
                    .into_iter()
                    .next();
                let Some(mut entry) = found else {
                    return Ok(None);
                };
                touch(tx, &entry.id, now)?;
                entry.access_count += 1;
                entry.accessed_at = ms_to_datetime(now);
                Ok(Some(entry))
            })
            .await
    }

    /// Insert or replace the entry for `key`.
    ///
    /// Replacing keeps the row id but resets timestamps, access count and
    /// expiry. `ttl_hours` defaults to `cache.default_ttl_hours`.
    pub async fn set(&self, key: &str, payload: CachePayload, ttl_hours: Option<f64>) -> Result<CacheEntry> {
        let key = key.to_string();
        let ttl_hours = ttl_hours.unwrap_or(self.config.default_ttl_hours);
        let entry = self
            .store
            .transaction(move |tx| {
                let now = Utc::now().timestamp_millis();
                let token_count = payload
                    .token_count
                    .unwrap_or_else(|| estimate_tokens(&payload.assembled_context));
                let summary_ids = serde_json::to_string(&payload.summary_ids)?;

                tx.prepare_cached(
                    "INSERT INTO context_cache
                         (id, cache_key, summary_ids, assembled_context, token_count,
                          created_at, accessed_at, access_count, expires_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6, 0, ?7)
                     ON CONFLICT(cache_key) DO UPDATE SET
                         summary_ids = excluded.summary_ids,
                         assembled_context = excluded.assembled_context,
                         token_count = excluded.token_count,
                         created_at = excluded.created_at,
                         accessed_at = excluded.accessed_at,
                         access_count = 0,
                         expires_at = excluded.expires_at",
                )?
                .execute(params![
                    uuid::Uuid::now_v7().to_string(),
                    key,
                    summary_ids,
                    payload.assembled_context,
                    token_count,
                    now,
                    expiry_for(now, ttl_hours),
                ])?;

                let entry = Self::find_where(tx, "WHERE cache_key = ?1", [&key])?
                    .into_iter()
                    .next()
                    .ok_or(rusqlite::Error::QueryReturnedNoRows)?;
                Ok(entry)
            })
            .await?;

        tracing::debug!(key = %entry.cache_key, tokens = entry.token_count, "context cached");
        Ok(entry)
    }

    /// Delete every entry whose key matches the SQL `LIKE` pattern.
    pub async fn invalidate(&self, pattern: &str) -> Result<usize> {
        let pattern = pattern.to_string();
        let removed = self
            .store
            .transaction(move |tx| {
                Ok(tx
                    .prepare_cached("DELETE FROM context_cache WHERE cache_key LIKE ?1")?
                    .execute([&pattern])?)
            })
            .await?;
        tracing::info!(removed, "context cache invalidated");
        Ok(removed)
    }

    /// Remove expired rows, then evict least recently accessed rows beyond
    /// `cache.max_entries`.
    pub async fn cleanup(&self) -> Result<CleanupResult> {
        let max_entries = self.config.max_entries as i64;
        let result = self
            .store
            .transaction(move |tx| {
                let now = Utc::now().timestamp_millis();
                let expired = tx
                    .prepare_cached("DELETE FROM context_cache WHERE expires_at IS NOT NULL AND expires_at <= ?1")?
                    .execute([now])?;

                let remaining = Self::count(tx)? as i64;
                let surplus = (remaining - max_entries).max(0);
                let evicted = if surplus > 0 {
                    tx.prepare_cached(
                        "DELETE FROM context_cache WHERE id IN (
                             SELECT id FROM context_cache
                             ORDER BY accessed_at ASC, created_at ASC
                             LIMIT ?1
                         )",
                    )?
                    .execute([surplus])?
                } else {
                    0
                };
                Ok(CleanupResult { expired, evicted })
            })
            .await?;

        tracing::info!(expired = result.expired, evicted = result.evicted, "context cache cleanup");
        Ok(result)
    }

    /// Record an access without reading the entry.
    pub async fn update_access(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.store
            .transaction(move |tx| touch(tx, &id, Utc::now().timestamp_millis()))
            .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.store
            .with_connection(move |conn| {
                let now = Utc::now().timestamp_millis();
                let found = conn
                    .prepare_cached(&format!("SELECT 1 FROM context_cache WHERE cache_key = ?2 AND {LIVE}"))?
                    .query_row(params![now, key], |_| Ok(()))
                    .optional()?;
                Ok(found.is_some())
            })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_string();
        self.store
            .transaction(move |tx| {
                let deleted = tx
                    .prepare_cached("DELETE FROM context_cache WHERE cache_key = ?1")?
                    .execute([&key])?;
                Ok(deleted > 0)
            })
            .await
    }

    /// Live entries built from the given summary, most recently accessed first.
    pub async fn find_by_summary_id(&self, summary_id: &str) -> Result<Vec<CacheEntry>> {
        let summary_id = summary_id.to_string();
        self.store
            .with_connection(move |conn| {
                let now = Utc::now().timestamp_millis();
                Self::find_where(
                    conn,
                    &format!(
                        "WHERE EXISTS (SELECT 1 FROM json_each(context_cache.summary_ids) WHERE value = ?2)
                         AND {LIVE} ORDER BY accessed_at DESC"
                    ),
                    params![now, summary_id],
                )
            })
            .await
    }

    pub async fn find_recently_accessed(&self, limit: usize) -> Result<Vec<CacheEntry>> {
        self.store
            .with_connection(move |conn| {
                let now = Utc::now().timestamp_millis();
                Self::find_where(
                    conn,
                    &format!("WHERE {LIVE} ORDER BY accessed_at DESC LIMIT ?2"),
                    params![now, limit as i64],
                )
            })
            .await
    }

    pub async fn stats(&self) -> Result<CacheRepositoryStats> {
        self.store
            .with_connection(|conn| {
                let now = Utc::now().timestamp_millis();
                let stats = conn
                    .prepare_cached(
                        "SELECT COUNT(*),
                                COALESCE(SUM(CASE WHEN expires_at IS NOT NULL AND expires_at <= ?1 THEN 1 ELSE 0 END), 0),
                                COALESCE(SUM(token_count), 0),
                                COALESCE(SUM(access_count), 0),
                                MIN(accessed_at)
                         FROM context_cache",
                    )?
                    .query_row([now], |row| {
                        Ok(CacheRepositoryStats {
                            entries: row.get::<_, i64>(0)? as u64,
                            expired_entries: row.get::<_, i64>(1)? as u64,
                            total_tokens: row.get(2)?,
                            total_accesses: row.get(3)?,
                            oldest_access: row.get::<_, Option<i64>>(4)?.map(ms_to_datetime),
                        })
                    })?;
                Ok(stats)
            })
            .await
    }
}

fn touch(conn: &Connection, id: &str, now_ms: i64) -> Result<bool> {
    let updated = conn
        .prepare_cached("UPDATE context_cache SET accessed_at = ?2, access_count = access_count + 1 WHERE id = ?1")?
        .execute(params![id, now_ms])?;
    Ok(updated > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
        // counted in characters, not bytes
        assert_eq!(estimate_tokens("ééééé"), 2);
    }

    #[test]
    fn expiry_from_hours() {
        assert_eq!(expiry_for(1_000, 1.0), Some(1_000 + 3_600_000));
        assert_eq!(expiry_for(0, 0.5), Some(1_800_000));
        assert_eq!(expiry_for(0, 0.0), None);
        assert_eq!(expiry_for(0, -2.0), None);
        assert_eq!(expiry_for(0, f64::NAN), None);
    }

    #[test]
    fn huge_ttl_clamps_instead_of_overflowing() {
        let now = Utc::now().timestamp_millis();
        assert_eq!(expiry_for(now, 1e18), Some(latest_ms()));
        assert_eq!(expiry_for(i64::MAX - 1, 1.0), Some(latest_ms()));
        assert_eq!(ms_to_datetime(latest_ms()).timestamp_millis(), latest_ms());
    }
}
