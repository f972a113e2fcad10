use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;

use super::cache::CacheStats;
use super::QueryMetric;

/// Slow queries listed in a report, at most.
pub const MAX_SLOW_QUERIES: usize = 10;

/// Hit rate below which the report suggests longer TTLs or explicit keys.
const LOW_HIT_RATE: f64 = 0.5;

/// Samples needed before hit rate is judged at all.
const MIN_SAMPLES_FOR_HIT_RATE: usize = 20;

#[derive(Debug, Clone, Serialize)]
pub struct SlowQuery {
    /// Normalized query text.
    pub query: String,
    pub executions: usize,
    pub average_ms: f64,
    pub max_ms: f64,
    pub total_rows: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub generated_at: DateTime<Utc>,
    pub total_queries: usize,
    pub cache_hits: usize,
    pub cache_hit_rate: f64,
    /// Mean over executed (non-cached) queries.
    pub average_execution_ms: f64,
    pub slow_query_threshold_ms: f64,
    pub slow_queries: Vec<SlowQuery>,
    pub cache: CacheStats,
    pub recommendations: Vec<String>,
}

#[derive(Default)]
struct Group {
    executions: usize,
    total_ms: f64,
    max_ms: f64,
    total_rows: usize,
}

pub(crate) fn build(metrics: &[QueryMetric], cache: CacheStats, threshold_ms: f64) -> PerformanceReport {
    let total_queries = metrics.len();
    let cache_hits = metrics.iter().filter(|m| m.cache_hit).count();

    let mut groups: HashMap<&str, Group> = HashMap::new();
    let mut executed_ms = 0.0;
    let mut executed = 0usize;
    for metric in metrics.iter().filter(|m| !m.cache_hit) {
        let ms = metric.execution_ms();
        executed_ms += ms;
        executed += 1;

        let group = groups.entry(metric.query.as_str()).or_default();
        group.executions += 1;
        group.total_ms += ms;
        group.max_ms = group.max_ms.max(ms);
        group.total_rows += metric.row_count;
    }

    let mut slow_queries: Vec<SlowQuery> = groups
        .into_iter()
        .map(|(query, g)| SlowQuery {
            query: query.to_string(),
            executions: g.executions,
            average_ms: g.total_ms / g.executions as f64,
            max_ms: g.max_ms,
            total_rows: g.total_rows,
        })
        .filter(|q| q.average_ms > threshold_ms)
        .collect();
    slow_queries.sort_by(|a, b| b.average_ms.total_cmp(&a.average_ms));
    slow_queries.truncate(MAX_SLOW_QUERIES);

    let cache_hit_rate = if total_queries == 0 {
        0.0
    } else {
        cache_hits as f64 / total_queries as f64
    };

    let mut recommendations = Vec::new();
    for slow in &slow_queries {
        recommendations.push(format!(
            "Query averaging {:.1}ms over {} runs: check its plan with analyze_query ({})",
            slow.average_ms, slow.executions, slow.query
        ));
    }
    if total_queries >= MIN_SAMPLES_FOR_HIT_RATE && cache_hit_rate < LOW_HIT_RATE {
        recommendations.push(format!(
            "Cache hit rate is {:.0}%: consider longer TTLs or stable cache keys for repeated reads",
            cache_hit_rate * 100.0
        ));
    }
    if cache.evictions > 0 {
        recommendations.push(format!(
            "{} cache evictions so far: consider raising query.cache_capacity above {}",
            cache.evictions, cache.capacity
        ));
    }

    PerformanceReport {
        generated_at: Utc::now(),
        total_queries,
        cache_hits,
        cache_hit_rate,
        average_execution_ms: if executed == 0 { 0.0 } else { executed_ms / executed as f64 },
        slow_query_threshold_ms: threshold_ms,
        slow_queries,
        cache,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sample(query: &str, ms: u64, hit: bool) -> QueryMetric {
        QueryMetric {
            query: query.to_string(),
            execution_time: Duration::from_millis(ms),
            row_count: 1,
            cache_hit: hit,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn empty_log_yields_empty_report() {
        let report = build(&[], CacheStats::default(), 100.0);
        assert_eq!(report.total_queries, 0);
        assert_eq!(report.cache_hit_rate, 0.0);
        assert!(report.slow_queries.is_empty());
        assert!(report.recommendations.is_empty());
    }

    #[test]
    fn slow_queries_are_grouped_and_sorted() {
        let metrics = vec![
            sample("select a", 150, false),
            sample("select a", 250, false),
            sample("select b", 500, false),
            sample("select c", 20, false),
            sample("select c", 0, true),
        ];
        let report = build(&metrics, CacheStats::default(), 100.0);

        assert_eq!(report.total_queries, 5);
        assert_eq!(report.cache_hits, 1);
        assert!((report.cache_hit_rate - 0.2).abs() < 1e-9);
        assert_eq!(report.slow_queries.len(), 2);
        assert_eq!(report.slow_queries[0].query, "select b");
        assert_eq!(report.slow_queries[1].query, "select a");
        assert_eq!(report.slow_queries[1].executions, 2);
        assert!((report.slow_queries[1].average_ms - 200.0).abs() < 1e-9);
        // (150 + 250 + 500 + 20) / 4 executed
        assert!((report.average_execution_ms - 230.0).abs() < 1e-9);
    }

    #[test]
    fn slow_list_is_capped() {
        let metrics: Vec<_> = (0..15)
            .map(|i| sample(&format!("select {i}"), 200 + i, false))
            .collect();
        let report = build(&metrics, CacheStats::default(), 100.0);
        assert_eq!(report.slow_queries.len(), MAX_SLOW_QUERIES);
        assert_eq!(report.slow_queries[0].query, "select 14");
    }

    #[test]
    fn low_hit_rate_is_recommended_against() {
        let metrics: Vec<_> = (0..30).map(|_| sample("select 1", 1, false)).collect();
        let report = build(&metrics, CacheStats::default(), 100.0);
        assert!(report.recommendations.iter().any(|r| r.contains("hit rate")));
    }
}
