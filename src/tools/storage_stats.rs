//! MCP `storage_stats` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `storage_stats` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct StorageStatsParams {
    /// Also run the pool and integrity checks. Defaults to false.
    #[schemars(description = "Also run pool and database health checks (slower). Defaults to false.")]
    pub include_health: Option<bool>,
}
