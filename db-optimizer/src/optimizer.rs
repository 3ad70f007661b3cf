//! High-level entry point for index analysis, slow query triage and maintenance.
//!
//! [`DatabaseOptimizer`] owns nothing but its collaborators and configuration.
//! Every call re-reads the catalogs; no result is cached between calls, so two
//! callers can analyze and maintain the same database at the same time.
//!
//! ## Operations
//!
//! - **analyze_indexes**: unused, missing-FK and duplicate index recommendations
//! - **analyze_slow_queries**: slowest statements above the latency threshold
//! - **table_stats**: per-table write and bloat counters
//! - **database_overview**: table and index footprint with scan counts, plus
//!   connection pool counters
//! - **optimize_database**: `ANALYZE`, `VACUUM`, then `REINDEX` of bloated tables
//!
//! Each operation takes a [`CancellationToken`]; once it fires, no further
//! statement is issued and the call returns
//! [`OptimizerError::Cancelled`](crate::error::OptimizerError::Cancelled).

use crate::catalog::{
    CatalogReader, MaintenanceExecutor, PoolStatus, QueryStats, TableSize, TableStats,
};
use crate::config::OptimizerConfig;
use crate::context::RunContext;
use crate::error::Result;
use crate::events::{EventSink, TracingSink};
use crate::maintenance::{MaintenanceOrchestrator, MaintenanceReport};
use crate::recommend::{IndexAdvisor, IndexRecommendation};
use crate::slow_query::SlowQueryAnalyzer;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Footprint and usage of one index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSize {
    pub table: String,
    pub index: String,
    pub size_bytes: i64,
    pub scans: i64,
    pub is_primary: bool,
}

/// Storage report for the application schema
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DatabaseOverview {
    /// Largest first
    pub tables: Vec<TableSize>,
    /// Largest first
    pub indexes: Vec<IndexSize>,
    pub total_bytes: i64,
    pub total_index_bytes: i64,
    /// Counters of the catalog's connection pool, when it has one
    pub pool: Option<PoolStatus>,
}

/// Database optimization engine.
pub struct DatabaseOptimizer {
    catalog: Arc<dyn CatalogReader>,
    executor: Arc<dyn MaintenanceExecutor>,
    events: Arc<dyn EventSink>,
    config: OptimizerConfig,
}

impl std::fmt::Debug for DatabaseOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseOptimizer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DatabaseOptimizer {
    /// Build an optimizer over one backend that both reads catalogs and
    /// executes maintenance, such as [`PgCatalog`](crate::catalog::PgCatalog).
    pub fn new<B>(backend: B, config: OptimizerConfig) -> Result<Self>
    where
        B: CatalogReader + MaintenanceExecutor + 'static,
    {
        let backend = Arc::new(backend);
        Self::from_parts(backend.clone(), backend, config)
    }

    /// Build an optimizer from separately owned collaborators.
    pub fn from_parts(
        catalog: Arc<dyn CatalogReader>,
        executor: Arc<dyn MaintenanceExecutor>,
        config: OptimizerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            catalog,
            executor,
            events: Arc::new(TracingSink),
            config,
        })
    }

    /// Report recovered failures and progress to `events` instead of `tracing`.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    fn context(&self, cancel: &CancellationToken) -> RunContext {
        RunContext::new(cancel.clone()).with_timeout(self.config.statement_timeout())
    }

    /// Index recommendations from the three advisory passes.
    pub async fn analyze_indexes(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<IndexRecommendation>> {
        let ctx = self.context(cancel);
        IndexAdvisor::new(
            self.catalog.as_ref(),
            self.events.as_ref(),
            &ctx,
            &self.config.schema,
        )
        .analyze()
        .await
    }

    /// Statements slower than the configured threshold, slowest first.
    pub async fn analyze_slow_queries(&self, cancel: &CancellationToken) -> Result<Vec<QueryStats>> {
        let ctx = self.context(cancel);
        SlowQueryAnalyzer::new(
            self.catalog.as_ref(),
            &ctx,
            self.config.slow_query_threshold_ms,
            self.config.slow_query_limit,
        )
        .analyze()
        .await
    }

    pub async fn table_stats(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BTreeMap<String, TableStats>> {
        self.context(cancel)
            .run("table_statistics", self.catalog.table_statistics())
            .await
    }

    /// Table sizes plus index sizes joined with their scan counters, and
    /// the connection pool counters.
    pub async fn database_overview(&self, cancel: &CancellationToken) -> Result<DatabaseOverview> {
        let ctx = self.context(cancel);
        let mut tables = ctx.run("table_sizes", self.catalog.table_sizes()).await?;
        let indexes = ctx.run("list_indexes", self.catalog.list_indexes()).await?;
        let usage = ctx.run("index_usage", self.catalog.index_usage()).await?;

        tables.sort_by(|a, b| {
            b.total_bytes
                .cmp(&a.total_bytes)
                .then_with(|| a.table.cmp(&b.table))
        });
        let mut indexes: Vec<IndexSize> = indexes
            .into_iter()
            .map(|index| IndexSize {
                scans: usage.scans(&index.key()),
                table: index.table_name,
                index: index.index_name,
                size_bytes: index.size_bytes,
                is_primary: index.is_primary,
            })
            .collect();
        indexes.sort_by(|a, b| {
            b.size_bytes
                .cmp(&a.size_bytes)
                .then_with(|| (&a.table, &a.index).cmp(&(&b.table, &b.index)))
        });

        Ok(DatabaseOverview {
            total_bytes: tables.iter().map(|t| t.total_bytes).sum(),
            total_index_bytes: indexes.iter().map(|i| i.size_bytes).sum(),
            tables,
            indexes,
            pool: self.catalog.pool_status(),
        })
    }

    /// Run the four maintenance phases.
    ///
    /// A failed statistics refresh, space reclamation or bloat read returns
    /// [`OptimizerError::Maintenance`](crate::error::OptimizerError::Maintenance)
    /// naming the phase. Failed table rebuilds are listed in the report instead.
    pub async fn optimize_database(&self, cancel: &CancellationToken) -> Result<MaintenanceReport> {
        let ctx = self.context(cancel);
        MaintenanceOrchestrator::new(
            self.catalog.as_ref(),
            self.executor.as_ref(),
            self.events.as_ref(),
            &ctx,
            self.config.bloat_ratio_threshold,
        )
        .run()
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{IndexInfo, MemoryCatalog};
    use crate::error::OptimizerError;

    #[test]
    fn rejects_invalid_config() {
        let err = DatabaseOptimizer::new(
            MemoryCatalog::new(),
            OptimizerConfig::default().with_slow_query_limit(0),
        )
        .unwrap_err();
        assert!(matches!(err, OptimizerError::InvalidConfig { .. }));
    }

    #[tokio::test]
    async fn overview_joins_sizes_and_usage() -> anyhow::Result<()> {
        let catalog = MemoryCatalog::new()
            .with_table_size(TableSize {
                table: "orders".to_string(),
                total_bytes: 8192,
                table_bytes: 4096,
                index_bytes: 4096,
            })
            .with_table_size(TableSize {
                table: "events".to_string(),
                total_bytes: 65536,
                table_bytes: 49152,
                index_bytes: 16384,
            })
            .with_index(IndexInfo::new("orders", "orders_pkey", &["id"]).primary().with_size(2048))
            .with_index(IndexInfo::new("events", "idx_events_created_at", &["created_at"]).with_size(16384))
            .with_usage("events", "idx_events_created_at", 31);
        let optimizer = DatabaseOptimizer::new(catalog, OptimizerConfig::default())?;

        let overview = optimizer
            .database_overview(&CancellationToken::new())
            .await?;

        assert_eq!(overview.tables[0].table, "events");
        assert_eq!(overview.total_bytes, 73728);
        assert_eq!(overview.indexes[0].index, "idx_events_created_at");
        assert_eq!(overview.indexes[0].scans, 31);
        assert_eq!(overview.indexes[1].scans, 0);
        assert_eq!(overview.total_index_bytes, 18432);
        assert_eq!(overview.pool, None);
        Ok(())
    }
}
