//! MCP `analyze_query` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `analyze_query` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AnalyzeQueryParams {
    /// SQL statement to plan. It is not executed.
    #[schemars(description = "SQL statement to analyze with EXPLAIN QUERY PLAN. It is not executed.")]
    pub sql: String,

    /// Positional parameters bound to `?1`, `?2`, ...
    #[schemars(description = "Positional parameters for ?1, ?2, ... (strings, numbers, booleans or null)")]
    pub params: Option<Vec<serde_json::Value>>,
}
