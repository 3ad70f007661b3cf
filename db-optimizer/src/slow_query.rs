//! Slow query triage over aggregated statement statistics.

use crate::catalog::{CatalogReader, QueryStats};
use crate::context::RunContext;
use crate::error::Result;
use std::cmp::Ordering;

/// Keep queries strictly slower than `threshold_ms` on average, slowest
/// first, at most `limit` of them.
///
/// Ties on mean time go to the query with more calls, then by query text, so
/// the output does not depend on the order the statistics arrived in.
pub fn rank_slow_queries(
    mut queries: Vec<QueryStats>,
    threshold_ms: f64,
    limit: usize,
) -> Vec<QueryStats> {
    queries.retain(|q| q.mean_exec_time_ms > threshold_ms);
    queries.sort_by(|a, b| {
        b.mean_exec_time_ms
            .total_cmp(&a.mean_exec_time_ms)
            .then_with(|| b.calls.cmp(&a.calls))
            .then_with(|| a.query.cmp(&b.query))
    });
    queries.truncate(limit);
    queries
}

/// Reads statement statistics and ranks them.
pub struct SlowQueryAnalyzer<'a> {
    catalog: &'a dyn CatalogReader,
    ctx: &'a RunContext,
    threshold_ms: f64,
    limit: usize,
}

impl<'a> SlowQueryAnalyzer<'a> {
    pub fn new(
        catalog: &'a dyn CatalogReader,
        ctx: &'a RunContext,
        threshold_ms: f64,
        limit: usize,
    ) -> Self {
        Self {
            catalog,
            ctx,
            threshold_ms,
            limit,
        }
    }

    pub async fn analyze(&self) -> Result<Vec<QueryStats>> {
        let queries = self
            .ctx
            .run(
                "query_statistics",
                self.catalog.query_statistics(self.threshold_ms, self.limit),
            )
            .await?;
        Ok(rank_slow_queries(queries, self.threshold_ms, self.limit))
    }
}

/// Whether `ranked` is non-increasing by mean execution time.
pub fn is_ranked(ranked: &[QueryStats]) -> bool {
    ranked.windows(2).all(|pair| {
        pair[0].mean_exec_time_ms.total_cmp(&pair[1].mean_exec_time_ms) != Ordering::Less
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_queries_above_threshold_survive() {
        let ranked = rank_slow_queries(
            vec![
                QueryStats::new("SELECT * FROM orders WHERE status = $1", 800.0, 10),
                QueryStats::new("SELECT * FROM events ORDER BY created_at", 1500.0, 3),
            ],
            1000.0,
            20,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].mean_exec_time_ms, 1500.0);
    }

    #[test]
    fn threshold_is_strict() {
        let ranked = rank_slow_queries(vec![QueryStats::new("q", 1000.0, 1)], 1000.0, 20);
        assert!(ranked.is_empty());
    }

    #[test]
    fn capped_and_sorted_descending() {
        let queries = (0..50)
            .map(|i| QueryStats::new(format!("q{i}"), 1000.0 + ((i * 37) % 50) as f64 * 10.0 + 1.0, i))
            .collect();
        let ranked = rank_slow_queries(queries, 1000.0, 20);

        assert_eq!(ranked.len(), 20);
        assert!(is_ranked(&ranked));
        assert_eq!(ranked[0].mean_exec_time_ms, 1491.0);
    }

    #[test]
    fn ties_break_on_calls_then_text() {
        let ranked = rank_slow_queries(
            vec![
                QueryStats::new("b", 2000.0, 5),
                QueryStats::new("a", 2000.0, 5),
                QueryStats::new("c", 2000.0, 9),
            ],
            1000.0,
            20,
        );
        let order: Vec<_> = ranked.iter().map(|q| q.query.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }
}
