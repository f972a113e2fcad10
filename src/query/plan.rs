//! Heuristic query-plan analysis over `EXPLAIN QUERY PLAN`.

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

/// Cost added for a full table scan.
pub const FULL_SCAN_COST: i64 = 1000;
/// Cost added for an index-assisted step.
pub const INDEX_COST: i64 = 10;
/// Cost added for a full-text-search virtual table step.
pub const FTS_COST: i64 = 50;
/// Cost added for a sort through a temporary B-tree.
pub const TEMP_SORT_COST: i64 = 100;
/// Cost reported when the plan cannot be obtained.
pub const FAILED_ANALYSIS_COST: i64 = -1;

#[derive(Debug, Clone, Serialize)]
pub struct QueryAnalysis {
    pub query: String,
    pub estimated_cost: i64,
    pub uses_index: bool,
    pub index_names: Vec<String>,
    pub uses_fts: bool,
    pub full_scan_tables: Vec<String>,
    pub recommendations: Vec<String>,
    /// Raw plan step details, in plan order.
    pub plan: Vec<String>,
}

impl QueryAnalysis {
    fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            estimated_cost: 0,
            uses_index: false,
            index_names: Vec::new(),
            uses_fts: false,
            full_scan_tables: Vec::new(),
            recommendations: Vec::new(),
            plan: Vec::new(),
        }
    }

    /// `true` when the plan could not be produced (malformed SQL, missing table).
    pub fn failed(&self) -> bool {
        self.estimated_cost == FAILED_ANALYSIS_COST
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Step {
    FullScan { table: String },
    Index { name: String },
    Fts,
    TempSort,
    Other,
}

/// Classify one plan line. Handles both `SCAN t` (SQLite ≥ 3.36) and the
/// older `SCAN TABLE t` spellings.
fn classify(detail: &str) -> Step {
    if detail.contains("VIRTUAL TABLE") {
        return Step::Fts;
    }
    if detail.starts_with("USE TEMP B-TREE") {
        return Step::TempSort;
    }
    if let Some(name) = index_name(detail) {
        return Step::Index { name };
    }
    if let Some(rest) = detail.strip_prefix("SCAN ") {
        let rest = rest.strip_prefix("TABLE ").unwrap_or(rest);
        let table = rest.split_whitespace().next().unwrap_or_default();
        // subquery / CTE scans are not base-table scans
        if !table.is_empty() && !table.starts_with("SUBQUERY") && !table.starts_with("CONSTANT") {
            return Step::FullScan {
                table: table.to_string(),
            };
        }
    }
    Step::Other
}

fn index_name(detail: &str) -> Option<String> {
    if detail.contains("USING INTEGER PRIMARY KEY") || detail.contains("USING ROWID") {
        return Some("INTEGER PRIMARY KEY".to_string());
    }
    if detail.contains("USING AUTOMATIC") {
        return Some("automatic index".to_string());
    }
    let marker = if let Some(pos) = detail.find("USING COVERING INDEX ") {
        pos + "USING COVERING INDEX ".len()
    } else if let Some(pos) = detail.find("USING INDEX ") {
        pos + "USING INDEX ".len()
    } else {
        return None;
    };
    detail[marker..]
        .split_whitespace()
        .next()
        .map(|name| name.to_string())
}

/// Ask SQLite for the plan of `sql` and score it.
///
/// Never fails: a plan that cannot be produced yields a cost of
/// [`FAILED_ANALYSIS_COST`] with the error as a recommendation.
pub fn analyze(conn: &Connection, sql: &str, params: &[Value]) -> QueryAnalysis {
    let mut analysis = QueryAnalysis::empty(sql);

    let details = match explain(conn, sql, params) {
        Ok(details) => details,
        Err(err) => {
            tracing::debug!(error = %err, "query plan analysis failed");
            analysis.estimated_cost = FAILED_ANALYSIS_COST;
            analysis.recommendations.push(format!("Query analysis failed: {err}"));
            return analysis;
        }
    };

    for detail in &details {
        match classify(detail) {
            Step::FullScan { table } => {
                analysis.estimated_cost += FULL_SCAN_COST;
                analysis.recommendations.push(format!(
                    "Full table scan on {table}: consider an index on the filtered or joined columns"
                ));
                analysis.full_scan_tables.push(table);
            }
            Step::Index { name } => {
                analysis.estimated_cost += INDEX_COST;
                analysis.uses_index = true;
                if !analysis.index_names.contains(&name) {
                    analysis.index_names.push(name);
                }
            }
            Step::Fts => {
                analysis.estimated_cost += FTS_COST;
                analysis.uses_fts = true;
            }
            Step::TempSort => {
                analysis.estimated_cost += TEMP_SORT_COST;
                analysis.recommendations.push(
                    "Sorting through a temporary B-tree: consider an index matching the ORDER BY columns"
                        .to_string(),
                );
            }
            Step::Other => {}
        }
    }

    analysis.plan = details;
    analysis
}

fn explain(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("EXPLAIN QUERY PLAN {sql}"))?;
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| row.get::<_, String>(3))?;
    rows.collect()
}
