//! MCP `performance_report` tool parameter definition.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Parameters for the `performance_report` MCP tool.
#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct PerformanceReportParams {
    /// Include the raw metric log, newest last. Defaults to false.
    #[schemars(description = "Include the raw query metric samples. Defaults to false.")]
    pub include_samples: Option<bool>,
}
