//! Query optimizer: plan analysis, an in-memory result cache, batched writes
//! and a bounded log of execution metrics.

pub mod bulk;
pub mod cache;
pub mod plan;
pub mod report;

pub use bulk::BulkInsertOptions;
pub use cache::{CacheStats, CachedRows};
pub use plan::QueryAnalysis;
pub use report::{PerformanceReport, SlowQuery};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::QueryConfig;
use crate::db::rows::{query_rows, value_to_json, Row};
use crate::error::Result;
use cache::QueryCache;

/// Per-call cache controls for [`QueryOptimizer::execute_with_cache`].
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Explicit cache key. Defaults to the normalized SQL plus its parameters.
    pub cache_key: Option<String>,
    /// Entry lifetime. Defaults to `query.default_ttl_secs`.
    pub ttl: Option<Duration>,
    /// Skip the lookup and overwrite any cached entry.
    pub force_refresh: bool,
}

impl QueryOptions {
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            cache_key: Some(key.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetric {
    /// Normalized query text.
    pub query: String,
    #[serde(rename = "execution_ms", serialize_with = "as_millis")]
    pub execution_time: Duration,
    pub row_count: usize,
    pub cache_hit: bool,
    pub recorded_at: DateTime<Utc>,
}

impl QueryMetric {
    pub fn execution_ms(&self) -> f64 {
        self.execution_time.as_secs_f64() * 1000.0
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

/// Collapse runs of whitespace and lowercase, so formatting differences do
/// not split metric groups. Not used for cache keys: it folds string literals.
pub fn normalize_query(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Default cache key: the SQL text, outer whitespace trimmed, followed by the
/// JSON-encoded parameters.
pub fn cache_key(sql: &str, params: &[Value]) -> String {
    let params = serde_json::Value::Array(params.iter().map(value_to_json).collect());
    format!("{}|{}", sql.trim(), params)
}

pub struct QueryOptimizer {
    config: QueryConfig,
    cache: Mutex<QueryCache>,
    metrics: Mutex<VecDeque<QueryMetric>>,
}

impl QueryOptimizer {
    pub fn new(config: QueryConfig) -> Self {
        Self {
            cache: Mutex::new(QueryCache::new(config.cache_capacity)),
            metrics: Mutex::new(VecDeque::with_capacity(config.metrics_capacity.min(1024))),
            config,
        }
    }

    pub fn config(&self) -> &QueryConfig {
        &self.config
    }

    // Both guards protect plain data that is never left half-updated, so a
    // poisoned lock is recovered.
    fn cache(&self) -> MutexGuard<'_, QueryCache> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn metric_log(&self) -> MutexGuard<'_, VecDeque<QueryMetric>> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, sql: &str, execution_time: Duration, row_count: usize, cache_hit: bool) {
        let metric = QueryMetric {
            query: normalize_query(sql),
            execution_time,
            row_count,
            cache_hit,
            recorded_at: Utc::now(),
        };
        if !cache_hit && metric.execution_ms() > self.config.slow_query_threshold_ms {
            tracing::debug!(
                query = %metric.query,
                elapsed_ms = metric.execution_ms(),
                rows = row_count,
                "slow query"
            );
        }

        let mut log = self.metric_log();
        log.push_back(metric);
        while log.len() > self.config.metrics_capacity {
            log.pop_front();
        }
    }

    /// Run a read query through the result cache.
    pub fn execute_with_cache(
        &self,
        conn: &Connection,
        sql: &str,
        params: &[Value],
        options: &QueryOptions,
    ) -> Result<CachedRows> {
        let key = options
            .cache_key
            .clone()
            .unwrap_or_else(|| cache_key(sql, params));

        let (hit, generation) = {
            let mut cache = self.cache();
            let hit = if options.force_refresh {
                None
            } else {
                cache.get(&key, Instant::now())
            };
            (hit, cache.generation())
        };
        if let Some(rows) = hit {
            self.record(sql, Duration::ZERO, rows.len(), true);
            return Ok(rows);
        }

        let started = Instant::now();
        let rows: CachedRows = Arc::new(query_rows(conn, sql, params)?);
        self.record(sql, started.elapsed(), rows.len(), false);

        let ttl = options.ttl.unwrap_or_else(|| self.config.default_ttl());
        self.store_result(key, Arc::clone(&rows), ttl, generation);
        Ok(rows)
    }

    // An invalidation while the query ran means `rows` may predate a write;
    // they are returned to the caller but not cached.
    fn store_result(&self, key: String, rows: CachedRows, ttl: Duration, generation: u64) -> bool {
        let stored = self.cache().insert_if_current(generation, key, rows, ttl, Instant::now());
        if !stored {
            tracing::debug!("query cache invalidated during execution, result not cached");
        }
        stored
    }

    /// Run a query without consulting the cache. Still recorded in the metric log.
    pub fn execute(&self, conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let started = Instant::now();
        let rows = query_rows(conn, sql, params)?;
        self.record(sql, started.elapsed(), rows.len(), false);
        Ok(rows)
    }

    pub fn analyze_query(&self, conn: &Connection, sql: &str, params: &[Value]) -> QueryAnalysis {
        plan::analyze(conn, sql, params)
    }

    pub fn bulk_insert<C: AsRef<str>>(
        &self,
        conn: &mut Connection,
        table: &str,
        columns: &[C],
        rows: &[Vec<Value>],
        options: &BulkInsertOptions,
    ) -> Result<usize> {
        let started = Instant::now();
        let result = bulk::bulk_insert(conn, table, columns, rows, options);
        if let Ok(inserted) = &result {
            self.record(&format!("bulk insert into {table}"), started.elapsed(), *inserted, false);
        }
        result
    }

    /// Drop cached results whose key starts with `prefix`, or everything when `None`.
    pub fn invalidate(&self, prefix: Option<&str>) -> usize {
        let removed = self.cache().invalidate(prefix);
        if removed > 0 {
            tracing::debug!(removed, prefix = prefix.unwrap_or("*"), "query cache invalidated");
        }
        removed
    }

    pub fn clear_cache(&self) -> usize {
        self.invalidate(None)
    }

    pub fn purge_expired(&self) -> usize {
        self.cache().purge_expired(Instant::now())
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache().stats()
    }

    pub fn metrics(&self) -> Vec<QueryMetric> {
        self.metric_log().iter().cloned().collect()
    }

    pub fn performance_report(&self) -> PerformanceReport {
        let metrics = self.metrics();
        report::build(&metrics, self.cache_stats(), self.config.slow_query_threshold_ms)
    }

    /// Refresh planner statistics.
    pub fn optimize_database(&self, conn: &Connection) -> Result<()> {
        let started = Instant::now();
        conn.execute_batch("PRAGMA optimize; ANALYZE;")?;
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "database optimized");
        Ok(())
    }
}
