//! MCP `cache_invalidate` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `cache_invalidate` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct CacheInvalidateParams {
    /// SQL `LIKE` pattern matched against cache keys, e.g. `summary:conv1:%`.
    #[schemars(description = "SQL LIKE pattern matched against context cache keys, e.g. 'summary:conv1:%'")]
    pub pattern: String,

    /// Must be true when the pattern is a bare `%`, which clears everything.
    #[schemars(description = "Required (true) when the pattern is '%' and would remove every entry")]
    pub confirm: Option<bool>,
}
