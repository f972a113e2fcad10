//! MCP `cache_cleanup` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `cache_cleanup` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CacheCleanupParams {
    /// Also drop expired in-memory query results. Defaults to true.
    #[schemars(description = "Also purge expired in-memory query results. Defaults to true.")]
    pub purge_query_cache: Option<bool>,
}
