//! The storage facade.
//!
//! [`Store::open`] brings the schema up to date on a dedicated primary
//! connection before anything else touches the file, then builds the
//! connection pool and query optimizer over the same path. Writes that need
//! atomicity go through [`Store::transaction`] on the primary connection;
//! concurrent reads go through the pool.

use rusqlite::types::Value;
use rusqlite::{Connection, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::{AppConfig, PoolConfig, QueryConfig};
use crate::db::migrations::{self, Migration, MigrationStatus};
use crate::db::pool::{ConnectionPool, PoolHealth, PoolMetrics};
use crate::db::rows::Row;
use crate::db::{self, schema, HealthReport};
use crate::error::{Result, StorageError};
use crate::query::{
    BulkInsertOptions, CacheStats, CachedRows, PerformanceReport, QueryAnalysis, QueryMetric, QueryOptimizer,
    QueryOptions,
};

pub struct StoreOptions {
    pub pool: PoolConfig,
    pub query: QueryConfig,
    pub migrations: Vec<Migration>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            query: QueryConfig::default(),
            migrations: schema::migrations(),
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            pool: config.pool.clone(),
            query: config.query.clone(),
            migrations: schema::migrations(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StoreStats {
    pub path: PathBuf,
    pub schema_version: u32,
    pub db_size_bytes: u64,
    pub pool: PoolMetrics,
    pub query_cache: CacheStats,
}

#[derive(Debug, Serialize)]
pub struct StoreHealth {
    pub healthy: bool,
    pub pool: PoolHealth,
    pub database: Option<HealthReport>,
    pub issues: Vec<String>,
}

/// Handle to one database. Cheap to clone; clones share the primary
/// connection, the pool and the query cache.
#[derive(Clone)]
pub struct Store {
    path: Arc<PathBuf>,
    primary: Arc<Mutex<Connection>>,
    pool: ConnectionPool,
    optimizer: Arc<QueryOptimizer>,
    migrations: Arc<[Migration]>,
}

impl Store {
    /// Open `path`, apply pending migrations, then start the pool.
    ///
    /// A migration failure aborts the open; no pool is created against a
    /// schema that is not current.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut primary = db::open_connection(&path)?;
        let applied = migrations::run_migrations(&mut primary, &options.migrations)?;
        let version = migrations::current_version(&primary)?;
        if applied.is_empty() {
            tracing::debug!(version, "schema up to date");
        } else {
            tracing::info!(applied = applied.len(), version, "schema migrated");
        }

        let pool = ConnectionPool::new(&path, options.pool)?;
        let optimizer = Arc::new(QueryOptimizer::new(options.query));

        tracing::info!(db = %path.display(), "store ready");
        Ok(Self {
            path: Arc::new(path),
            primary: Arc::new(Mutex::new(primary)),
            pool,
            optimizer,
            migrations: options.migrations.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn with_primary<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let primary = Arc::clone(&self.primary);
        tokio::task::spawn_blocking(move || -> Result<T> {
            let mut conn = primary
                .lock()
                .map_err(|_| StorageError::LockPoisoned("primary connection"))?;
            f(&mut conn)
        })
        .await?
    }

    /// Run `f` in one transaction on the primary connection.
    ///
    /// Commits when `f` returns `Ok`, rolls back otherwise. A commit that
    /// changed any row clears the query result cache.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let optimizer = Arc::clone(&self.optimizer);
        self.with_primary(move |conn| {
            let tx = conn.transaction()?;
            let before = total_changes(&tx)?;
            let value = f(&tx)?;
            let wrote = total_changes(&tx)? != before;
            tx.commit()?;
            if wrote {
                optimizer.clear_cache();
            }
            Ok(value)
        })
        .await
    }

    /// Run `f` on a pooled connection. For reads that need more than one
    /// statement; nothing here touches the query cache.
    pub async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.pool.with_connection(f).await
    }

    /// Cached read. Rows are decoded into `T` by column name.
    pub async fn execute_optimized<T>(&self, sql: &str, params: Vec<Value>, options: QueryOptions) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let rows = self.execute_optimized_rows(sql, params, options).await?;
        decode_rows(&rows)
    }

    /// Cached read returning the shared raw rows.
    pub async fn execute_optimized_rows(
        &self,
        sql: &str,
        params: Vec<Value>,
        options: QueryOptions,
    ) -> Result<CachedRows> {
        let optimizer = Arc::clone(&self.optimizer);
        let sql = sql.to_string();
        self.pool
            .with_connection(move |conn| optimizer.execute_with_cache(conn, &sql, &params, &options))
            .await
    }

    /// Uncached execution on a pooled connection. A statement that writes
    /// clears the query cache.
    pub async fn execute_pooled<T>(&self, sql: &str, params: Vec<Value>) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let optimizer = Arc::clone(&self.optimizer);
        let sql = sql.to_string();
        let rows = self
            .pool
            .with_connection(move |conn| {
                let read_only = conn.prepare_cached(&sql)?.readonly();
                let rows = optimizer.execute(conn, &sql, &params)?;
                if !read_only {
                    optimizer.clear_cache();
                }
                Ok(rows)
            })
            .await?;
        decode_rows(&rows)
    }

    pub async fn analyze_query(&self, sql: &str, params: Vec<Value>) -> Result<QueryAnalysis> {
        let optimizer = Arc::clone(&self.optimizer);
        let sql = sql.to_string();
        self.pool
            .with_connection(move |conn| Ok(optimizer.analyze_query(conn, &sql, &params)))
            .await
    }

    /// Batched insert on the primary connection. Batch size defaults to
    /// `query.batch_size`. Clears the query cache once any row may have landed.
    pub async fn bulk_insert(
        &self,
        table: &str,
        columns: Vec<String>,
        rows: Vec<Vec<Value>>,
        options: Option<BulkInsertOptions>,
    ) -> Result<usize> {
        let optimizer = Arc::clone(&self.optimizer);
        let table = table.to_string();
        let options = options.unwrap_or_else(|| BulkInsertOptions {
            batch_size: self.optimizer.config().batch_size,
            ..BulkInsertOptions::default()
        });
        self.with_primary(move |conn| {
            let result = optimizer.bulk_insert(conn, &table, &columns, &rows, &options);
            match &result {
                Ok(_) | Err(StorageError::BulkInsert { .. }) => {
                    optimizer.clear_cache();
                }
                Err(_) => {}
            }
            result
        })
        .await
    }

    /// Drop cached query results by key prefix, or all of them.
    pub fn invalidate_query_cache(&self, prefix: Option<&str>) -> usize {
        self.optimizer.invalidate(prefix)
    }

    pub fn purge_expired_queries(&self) -> usize {
        self.optimizer.purge_expired()
    }

    pub async fn schema_version(&self) -> Result<u32> {
        self.pool.with_connection(|conn| migrations::current_version(conn)).await
    }

    pub async fn migration_status(&self) -> Result<MigrationStatus> {
        let migrations = Arc::clone(&self.migrations);
        self.pool
            .with_connection(move |conn| migrations::migration_status(conn, &migrations))
            .await
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let schema_version = self.schema_version().await?;
        let db_size_bytes = std::fs::metadata(self.path.as_path()).map(|m| m.len()).unwrap_or(0);
        Ok(StoreStats {
            path: self.path.to_path_buf(),
            schema_version,
            db_size_bytes,
            pool: self.pool.metrics(),
            query_cache: self.optimizer.cache_stats(),
        })
    }

    pub fn performance_report(&self) -> PerformanceReport {
        self.optimizer.performance_report()
    }

    /// Raw metric samples, oldest first.
    pub fn query_metrics(&self) -> Vec<QueryMetric> {
        self.optimizer.metrics()
    }

    pub async fn health_check(&self) -> StoreHealth {
        let pool = self.pool.health_check().await;
        let mut issues = pool.issues.clone();

        let database = match self.pool.with_connection(|conn| db::check_database_health(conn)).await {
            Ok(report) => {
                if !report.integrity_ok {
                    issues.push(format!("integrity check failed: {}", report.integrity_details));
                }
                Some(report)
            }
            Err(err) => {
                issues.push(format!("database health check failed: {err}"));
                None
            }
        };

        StoreHealth {
            healthy: issues.is_empty(),
            pool,
            database,
            issues,
        }
    }

    /// Refresh planner statistics on the primary connection.
    pub async fn optimize(&self) -> Result<()> {
        let optimizer = Arc::clone(&self.optimizer);
        self.with_primary(move |conn| optimizer.optimize_database(conn)).await
    }

    /// Stop the pool and drop cached results. The primary connection closes
    /// with the last clone.
    pub fn shutdown(&self) {
        self.pool.shutdown();
        self.optimizer.clear_cache();
        tracing::info!(db = %self.path.display(), "store shut down");
    }
}

// Rows inserted, updated or deleted on this connection since it opened,
// trigger work included.
fn total_changes(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("SELECT total_changes()", [], |row| row.get(0))?)
}

fn decode_rows<T: DeserializeOwned>(rows: &[Row]) -> Result<Vec<T>> {
    rows.iter()
        .map(|row| Ok(serde_json::from_value(serde_json::Value::Object(row.clone()))?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::OptionalExtension;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Conversation {
        id: String,
        title: Option<String>,
    }

    fn open_store() -> (TempDir, Store) {
        let tmp = TempDir::new().unwrap();
        let options = StoreOptions {
            pool: PoolConfig {
                min_connections: 1,
                max_connections: 4,
                ..PoolConfig::default()
            },
            ..StoreOptions::default()
        };
        let store = Store::open(tmp.path().join("store.db"), options).unwrap();
        (tmp, store)
    }

    async fn add_conversation(store: &Store, id: &str, title: &str) {
        let (id, title) = (id.to_string(), title.to_string());
        store
            .transaction(move |tx| {
                tx.execute(
                    "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?1, ?2, 0, 0)",
                    rusqlite::params![id, title],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn open_migrates_to_latest() {
        let (_tmp, store) = open_store();
        assert_eq!(store.schema_version().await.unwrap(), 5);
        let status = store.migration_status().await.unwrap();
        assert!(status.pending.is_empty());
    }

    #[tokio::test]
    async fn transaction_commit_invalidates_cached_reads() {
        let (_tmp, store) = open_store();
        add_conversation(&store, "c1", "first").await;

        let sql = "SELECT id, title FROM conversations ORDER BY id";
        let before: Vec<Conversation> = store
            .execute_optimized(sql, vec![], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(before.len(), 1);

        add_conversation(&store, "c2", "second").await;
        let after: Vec<Conversation> = store
            .execute_optimized(sql, vec![], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[1].title.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn read_only_transaction_keeps_cached_reads() {
        let (_tmp, store) = open_store();
        let _: Vec<Row> = store
            .execute_optimized("SELECT 1 AS one", vec![], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(store.stats().await.unwrap().query_cache.entries, 1);

        let found: Option<String> = store
            .transaction(|tx| {
                Ok(tx
                    .query_row("SELECT id FROM conversations WHERE id = 'missing'", [], |row| row.get(0))
                    .optional()?)
            })
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(store.stats().await.unwrap().query_cache.entries, 1);

        add_conversation(&store, "c1", "first").await;
        assert_eq!(store.stats().await.unwrap().query_cache.entries, 0);
    }

    #[tokio::test]
    async fn string_literals_keep_their_case_in_cache_keys() {
        let (_tmp, store) = open_store();
        add_conversation(&store, "Bob", "upper").await;
        add_conversation(&store, "bob2", "lower").await;

        let upper: Vec<Conversation> = store
            .execute_optimized(
                "SELECT id, title FROM conversations WHERE id = 'Bob'",
                vec![],
                QueryOptions::default(),
            )
            .await
            .unwrap();
        let lower: Vec<Conversation> = store
            .execute_optimized(
                "SELECT id, title FROM conversations WHERE id = 'bob'",
                vec![],
                QueryOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(upper.len(), 1);
        assert_eq!(upper[0].id, "Bob");
        assert!(lower.is_empty());
    }

    #[tokio::test]
    async fn failed_transaction_leaves_no_trace() {
        let (_tmp, store) = open_store();
        let result: Result<()> = store
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO conversations (id, created_at, updated_at) VALUES ('c1', 0, 0)",
                    [],
                )?;
                tx.execute(
                    "INSERT INTO conversations (id, created_at, updated_at) VALUES ('c1', 0, 0)",
                    [],
                )?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(StorageError::Constraint { .. })));

        let rows: Vec<Row> = store
            .execute_pooled("SELECT id FROM conversations", vec![])
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn pooled_write_clears_cache() {
        let (_tmp, store) = open_store();
        let count_sql = "SELECT COUNT(*) AS n FROM conversations";
        let first: Vec<Row> = store
            .execute_optimized(count_sql, vec![], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(first[0]["n"], 0);

        let _: Vec<Row> = store
            .execute_pooled(
                "INSERT INTO conversations (id, created_at, updated_at) VALUES (?1, 0, 0)",
                vec![Value::Text("c9".into())],
            )
            .await
            .unwrap();

        let second: Vec<Row> = store
            .execute_optimized(count_sql, vec![], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(second[0]["n"], 1);
    }

    #[tokio::test]
    async fn bulk_insert_uses_configured_batches() {
        let (_tmp, store) = open_store();
        let rows: Vec<Vec<Value>> = (0..2500)
            .map(|i| {
                vec![
                    Value::Text(format!("c{i}")),
                    Value::Integer(0),
                    Value::Integer(0),
                ]
            })
            .collect();
        let inserted = store
            .bulk_insert(
                "conversations",
                vec!["id".into(), "created_at".into(), "updated_at".into()],
                rows,
                None,
            )
            .await
            .unwrap();
        assert_eq!(inserted, 2500);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.schema_version, 5);
        assert!(stats.db_size_bytes > 0);
    }

    #[tokio::test]
    async fn analyze_reports_index_use() {
        let (_tmp, store) = open_store();
        let analysis = store
            .analyze_query(
                "SELECT * FROM messages WHERE conversation_id = ?1",
                vec![Value::Text("c1".into())],
            )
            .await
            .unwrap();
        assert!(analysis.uses_index);
        assert!(!analysis.failed());
    }

    #[tokio::test]
    async fn health_and_report() {
        let (_tmp, store) = open_store();
        let _: Vec<Row> = store
            .execute_optimized("SELECT 1 AS one", vec![], QueryOptions::default())
            .await
            .unwrap();
        let _: Vec<Row> = store
            .execute_optimized("SELECT 1 AS one", vec![], QueryOptions::default())
            .await
            .unwrap();

        let report = store.performance_report();
        assert_eq!(report.total_queries, 2);
        assert_eq!(report.cache_hits, 1);

        let health = store.health_check().await;
        assert!(health.healthy, "issues: {:?}", health.issues);
        store.optimize().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_rejects_pooled_work() {
        let (_tmp, store) = open_store();
        store.shutdown();
        let result: Result<Vec<Row>> = store.execute_pooled("SELECT 1", vec![]).await;
        assert!(matches!(result, Err(StorageError::PoolShutdown)));
    }
}
