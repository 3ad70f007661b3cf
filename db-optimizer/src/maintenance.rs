//! Maintenance orchestration.
//!
//! A maintenance run walks four phases in a fixed order. Each phase declares
//! how its failures are handled:
//!
//! ```text
//! RefreshStatistics ─► ReclaimSpace ─► ComputeBloat ─► RebuildIndexes
//!      (fatal)            (fatal)         (fatal)        (per table)
//! ```
//!
//! The rebuild decision reads statistics computed after `ANALYZE` and `VACUUM`
//! have run, which is why the order cannot change. Each table is rebuilt in
//! its own statement, so a cancelled run leaves nothing to roll back.

use crate::catalog::{CatalogReader, MaintenanceExecutor, TableStats};
use crate::context::RunContext;
use crate::error::{OptimizerError, Result};
use crate::events::{Event, EventSink};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// How a phase failure affects the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Abort the run and return the error
    Fatal,
    /// Log the failed unit and continue with the next one
    PerUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenancePhase {
    RefreshStatistics,
    ReclaimSpace,
    ComputeBloat,
    RebuildIndexes,
}

impl MaintenancePhase {
    pub const ALL: [Self; 4] = [
        Self::RefreshStatistics,
        Self::ReclaimSpace,
        Self::ComputeBloat,
        Self::RebuildIndexes,
    ];

    pub fn failure_class(self) -> FailureClass {
        match self {
            Self::RebuildIndexes => FailureClass::PerUnit,
            _ => FailureClass::Fatal,
        }
    }

    pub fn next(self) -> Option<Self> {
        match self {
            Self::RefreshStatistics => Some(Self::ReclaimSpace),
            Self::ReclaimSpace => Some(Self::ComputeBloat),
            Self::ComputeBloat => Some(Self::RebuildIndexes),
            Self::RebuildIndexes => None,
        }
    }

    fn progress_message(self) -> &'static str {
        match self {
            Self::RefreshStatistics => "Analyzing tables...",
            Self::ReclaimSpace => "Vacuuming tables...",
            Self::ComputeBloat => "Checking for reindex needs...",
            Self::RebuildIndexes => "Rebuilding bloated indexes...",
        }
    }
}

impl fmt::Display for MaintenancePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RefreshStatistics => "refresh_statistics",
            Self::ReclaimSpace => "reclaim_space",
            Self::ComputeBloat => "compute_bloat",
            Self::RebuildIndexes => "rebuild_indexes",
        };
        f.write_str(name)
    }
}

/// Whether `stats` crosses the dead/live `threshold` (strictly).
///
/// A table without live rows never qualifies.
pub fn needs_rebuild(stats: &TableStats, threshold: f64) -> bool {
    stats.dead_tuples > 0
        && stats
            .dead_tuple_ratio()
            .is_some_and(|ratio| ratio > threshold)
}

/// Tables selected for an index rebuild, in name order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RebuildPlan {
    pub candidates: Vec<String>,
    /// Dead tuples but no live ones; there is nothing worth rebuilding for
    pub skipped_no_live_rows: Vec<String>,
}

pub fn plan_rebuilds(stats: &BTreeMap<String, TableStats>, threshold: f64) -> RebuildPlan {
    let mut plan = RebuildPlan::default();
    for (table, table_stats) in stats {
        if needs_rebuild(table_stats, threshold) {
            plan.candidates.push(table.clone());
        } else if table_stats.dead_tuples > 0 && table_stats.live_tuples <= 0 {
            plan.skipped_no_live_rows.push(table.clone());
        }
    }
    plan
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableFailure {
    pub table: String,
    pub error: String,
}

/// Outcome of a maintenance run that reached its last phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub phases_completed: Vec<MaintenancePhase>,
    pub rebuild_candidates: Vec<String>,
    pub rebuilt: Vec<String>,
    pub failed: Vec<TableFailure>,
    pub skipped_no_live_rows: Vec<String>,
}

/// Drives one maintenance run.
pub struct MaintenanceOrchestrator<'a> {
    catalog: &'a dyn CatalogReader,
    executor: &'a dyn MaintenanceExecutor,
    events: &'a dyn EventSink,
    ctx: &'a RunContext,
    bloat_threshold: f64,
}

impl<'a> MaintenanceOrchestrator<'a> {
    pub fn new(
        catalog: &'a dyn CatalogReader,
        executor: &'a dyn MaintenanceExecutor,
        events: &'a dyn EventSink,
        ctx: &'a RunContext,
        bloat_threshold: f64,
    ) -> Self {
        Self {
            catalog,
            executor,
            events,
            ctx,
            bloat_threshold,
        }
    }

    pub async fn run(&self) -> Result<MaintenanceReport> {
        self.events
            .record(Event::info("Starting database optimization..."));

        let mut report = MaintenanceReport::default();
        let mut table_stats = BTreeMap::new();
        let mut phase = Some(MaintenancePhase::RefreshStatistics);

        while let Some(current) = phase {
            self.events.record(Event::info(current.progress_message()));
            let outcome = self.run_phase(current, &mut table_stats, &mut report).await;
            if let Err(err) = outcome {
                return Err(attribute(current, err));
            }
            report.phases_completed.push(current);
            phase = current.next();
        }

        self.events.record(Event::info(format!(
            "Database optimization completed: {} rebuilt, {} failed",
            report.rebuilt.len(),
            report.failed.len()
        )));
        Ok(report)
    }

    async fn run_phase(
        &self,
        phase: MaintenancePhase,
        table_stats: &mut BTreeMap<String, TableStats>,
        report: &mut MaintenanceReport,
    ) -> Result<()> {
        match phase {
            MaintenancePhase::RefreshStatistics => {
                let step = self.executor.refresh_statistics();
                self.ctx.run("refresh_statistics", step).await
            }
            MaintenancePhase::ReclaimSpace => {
                let step = self.executor.reclaim_space();
                self.ctx.run("reclaim_space", step).await
            }
            MaintenancePhase::ComputeBloat => {
                let step = self.catalog.table_statistics();
                *table_stats = self.ctx.run("table_statistics", step).await?;
                Ok(())
            }
            MaintenancePhase::RebuildIndexes => self.rebuild_indexes(table_stats, report).await,
        }
    }

    async fn rebuild_indexes(
        &self,
        table_stats: &BTreeMap<String, TableStats>,
        report: &mut MaintenanceReport,
    ) -> Result<()> {
        let plan = plan_rebuilds(table_stats, self.bloat_threshold);
        for table in &plan.skipped_no_live_rows {
            self.events.record(Event::debug(format!(
                "Skipping table {table}: dead tuples but no live tuples"
            )));
        }
        report.rebuild_candidates = plan.candidates.clone();
        report.skipped_no_live_rows = plan.skipped_no_live_rows;

        for table in plan.candidates {
            if let Some(stats) = table_stats.get(&table) {
                self.events.record(Event::info(format!(
                    "Reindexing table {table} (dead tuples: {}, live tuples: {})",
                    stats.dead_tuples, stats.live_tuples
                )));
            }
            let step = self.executor.rebuild_table_indexes(&table);
            match self.ctx.run("rebuild_table_indexes", step).await {
                Ok(()) => report.rebuilt.push(table),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => {
                    let err = OptimizerError::TableMaintenance {
                        table: table.clone(),
                        source: Box::new(err),
                    };
                    self.events
                        .record(Event::warn(format!("Failed to reindex table {table}: {err}")));
                    report.failed.push(TableFailure {
                        table,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Wrap an error that escaped `phase` according to its failure class.
///
/// Cancellation passes through untouched. A per-unit phase has already
/// recorded its unit failures, so whatever escapes it is returned as is.
fn attribute(phase: MaintenancePhase, err: OptimizerError) -> OptimizerError {
    match phase.failure_class() {
        FailureClass::Fatal if !err.is_cancelled() => OptimizerError::Maintenance {
            phase,
            source: Box::new(err),
        },
        _ => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(entries: &[(&str, i64, i64)]) -> BTreeMap<String, TableStats> {
        entries
            .iter()
            .map(|(table, live, dead)| (table.to_string(), TableStats::with_tuples(*live, *dead)))
            .collect()
    }

    #[test]
    fn phases_run_in_order_with_declared_failure_class() {
        let mut walked = Vec::new();
        let mut phase = Some(MaintenancePhase::RefreshStatistics);
        while let Some(current) = phase {
            walked.push(current);
            phase = current.next();
        }
        assert_eq!(walked, MaintenancePhase::ALL);

        let classes: Vec<_> = MaintenancePhase::ALL
            .iter()
            .map(|p| p.failure_class())
            .collect();
        assert_eq!(
            classes,
            vec![
                FailureClass::Fatal,
                FailureClass::Fatal,
                FailureClass::Fatal,
                FailureClass::PerUnit
            ]
        );
    }

    #[test]
    fn failure_class_decides_error_wrapping() {
        let err = attribute(
            MaintenancePhase::ReclaimSpace,
            OptimizerError::invalid_config("boom"),
        );
        assert!(matches!(
            err,
            OptimizerError::Maintenance {
                phase: MaintenancePhase::ReclaimSpace,
                ..
            }
        ));

        let err = attribute(
            MaintenancePhase::RebuildIndexes,
            OptimizerError::invalid_config("boom"),
        );
        assert!(matches!(err, OptimizerError::InvalidConfig { .. }));

        let err = attribute(MaintenancePhase::RefreshStatistics, OptimizerError::Cancelled);
        assert!(matches!(err, OptimizerError::Cancelled));
    }

    #[test]
    fn ratio_boundary_is_strict() {
        let plan = plan_rebuilds(&stats(&[("events", 1000, 250), ("logs", 1000, 200)]), 0.2);
        assert_eq!(plan.candidates, vec!["events"]);
    }

    #[test]
    fn tables_without_live_rows_are_skipped() {
        let plan = plan_rebuilds(
            &stats(&[("archive", 0, 500), ("empty", 0, 0), ("clean", 100, 0)]),
            0.2,
        );
        assert!(plan.candidates.is_empty());
        assert_eq!(plan.skipped_no_live_rows, vec!["archive"]);
    }

    #[test]
    fn zero_threshold_still_needs_dead_tuples() {
        assert!(!needs_rebuild(&TableStats::with_tuples(10, 0), 0.0));
        assert!(needs_rebuild(&TableStats::with_tuples(10, 1), 0.0));
    }

    #[test]
    fn phase_names_are_snake_case() -> anyhow::Result<()> {
        assert_eq!(MaintenancePhase::ReclaimSpace.to_string(), "reclaim_space");
        assert_eq!(
            serde_json::to_string(&MaintenancePhase::ComputeBloat)?,
            "\"compute_bloat\""
        );
        Ok(())
    }
}
