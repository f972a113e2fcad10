pub mod analyze_query;
pub mod cache_cleanup;
pub mod cache_invalidate;
pub mod performance_report;
pub mod storage_stats;

use analyze_query::AnalyzeQueryParams;
use cache_cleanup::CacheCleanupParams;
use cache_invalidate::CacheInvalidateParams;
use performance_report::PerformanceReportParams;
use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use storage_stats::StorageStatsParams;

use convostore::db::rows::json_to_value;
use convostore::repository::CacheRepository;
use convostore::Store;

/// The convostore MCP tool handler. Holds the shared store and the context
/// cache repository and exposes the tools via the `#[tool_router]` macro.
#[derive(Clone)]
pub struct ConvoTools {
    tool_router: ToolRouter<Self>,
    store: Store,
    cache: CacheRepository,
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, String> {
    serde_json::to_string(value).map_err(|e| format!("serialization failed: {e}"))
}

#[tool_router]
impl ConvoTools {
    pub fn new(store: Store, cache: CacheRepository) -> Self {
        Self {
            tool_router: Self::tool_router(),
            store,
            cache,
        }
    }

    /// Storage engine statistics: schema version, file size, pool and query cache.
    #[tool(description = "Get storage statistics: schema version, database size, connection pool metrics, query cache and context cache counters. Optionally runs health checks.")]
    async fn storage_stats(
        &self,
        Parameters(params): Parameters<StorageStatsParams>,
    ) -> Result<String, String> {
        tracing::info!(include_health = ?params.include_health, "storage_stats called");

        let stats = self
            .store
            .stats()
            .await
            .map_err(|e| format!("stats failed: {e}"))?;
        let context_cache = self
            .cache
            .stats()
            .await
            .map_err(|e| format!("context cache stats failed: {e}"))?;

        let mut response = serde_json::json!({
            "storage": stats,
            "context_cache": context_cache,
        });
        if params.include_health.unwrap_or(false) {
            let health = self.store.health_check().await;
            response["health"] = serde_json::to_value(&health).map_err(|e| format!("serialization failed: {e}"))?;
        }

        Ok(response.to_string())
    }

    /// Query performance report from the in-memory metric log.
    #[tool(description = "Get the query performance report: cache hit rate, average execution time, slowest queries and tuning recommendations.")]
    async fn performance_report(
        &self,
        Parameters(params): Parameters<PerformanceReportParams>,
    ) -> Result<String, String> {
        tracing::info!("performance_report called");
        let report = self.store.performance_report();

        if params.include_samples.unwrap_or(false) {
            let samples = self.store.query_metrics();
            return Ok(serde_json::json!({ "report": report, "samples": samples }).to_string());
        }
        to_json(&report)
    }

    /// Plan a query without running it.
    #[tool(description = "Analyze a SQL query with EXPLAIN QUERY PLAN. Returns an estimated cost, index usage, full scans and recommendations. The query is not executed.")]
    async fn analyze_query(
        &self,
        Parameters(params): Parameters<AnalyzeQueryParams>,
    ) -> Result<String, String> {
        if params.sql.trim().is_empty() {
            return Err("sql must not be empty".into());
        }
        tracing::info!(sql_len = params.sql.len(), "analyze_query called");

        let bound = params
            .params
            .unwrap_or_default()
            .iter()
            .map(json_to_value)
            .collect();
        let analysis = self
            .store
            .analyze_query(&params.sql, bound)
            .await
            .map_err(|e| format!("analysis failed: {e}"))?;

        to_json(&analysis)
    }

    /// Remove context cache entries by key pattern.
    #[tool(description = "Invalidate context cache entries whose key matches a SQL LIKE pattern (e.g. 'summary:conv1:%'). A bare '%' requires confirm=true.")]
    async fn cache_invalidate(
        &self,
        Parameters(params): Parameters<CacheInvalidateParams>,
    ) -> Result<String, String> {
        if params.pattern.is_empty() {
            return Err("pattern must not be empty".into());
        }
        if params.pattern.chars().all(|c| c == '%') && params.confirm != Some(true) {
            return Err("pattern matches every entry; pass confirm=true to clear the whole cache".into());
        }
        tracing::info!(pattern = %params.pattern, "cache_invalidate called");

        let removed = self
            .cache
            .invalidate(&params.pattern)
            .await
            .map_err(|e| format!("invalidate failed: {e}"))?;

        Ok(serde_json::json!({ "pattern": params.pattern, "removed": removed }).to_string())
    }

    /// Expire and evict context cache entries.
    #[tool(description = "Clean up the context cache: delete expired entries, then evict least recently accessed entries above the configured maximum.")]
    async fn cache_cleanup(
        &self,
        Parameters(params): Parameters<CacheCleanupParams>,
    ) -> Result<String, String> {
        tracing::info!("cache_cleanup called");

        let result = self
            .cache
            .cleanup()
            .await
            .map_err(|e| format!("cleanup failed: {e}"))?;
        let purged = if params.purge_query_cache.unwrap_or(true) {
            self.store.purge_expired_queries()
        } else {
            0
        };

        Ok(serde_json::json!({
            "expired": result.expired,
            "evicted": result.evicted,
            "query_results_purged": purged,
        })
        .to_string())
    }
}

#[tool_handler]
impl ServerHandler for ConvoTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "convostore is a conversation storage engine. Use storage_stats and \
                 performance_report to observe it, analyze_query to check query plans, \
                 and cache_invalidate / cache_cleanup to manage the context cache."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
