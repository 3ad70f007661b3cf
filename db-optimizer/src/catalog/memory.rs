//! In-memory catalog for tests and dry runs.
//!
//! `MemoryCatalog` answers every [`CatalogReader`] call from data supplied up
//! front and records every maintenance statement instead of executing it.
//! Failures can be scripted per operation, optionally after a number of
//! successful calls, and per table for index rebuilds.

use super::{
    CatalogReader, ForeignKeyColumn, IndexInfo, IndexKey, IndexUsage, MaintenanceExecutor,
    QueryStats, TableSize, TableStats,
};
use crate::error::{OptimizerError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Operations whose failure can be scripted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CatalogOp {
    ListIndexes,
    IndexUsage,
    TableStatistics,
    ForeignKeyColumns,
    IndexExistsOnColumn,
    QueryStatistics,
    TableSizes,
    RefreshStatistics,
    ReclaimSpace,
}

impl CatalogOp {
    pub fn name(self) -> &'static str {
        match self {
            Self::ListIndexes => "list_indexes",
            Self::IndexUsage => "index_usage",
            Self::TableStatistics => "table_statistics",
            Self::ForeignKeyColumns => "foreign_key_columns",
            Self::IndexExistsOnColumn => "index_exists_on_column",
            Self::QueryStatistics => "query_statistics",
            Self::TableSizes => "table_sizes",
            Self::RefreshStatistics => "refresh_statistics",
            Self::ReclaimSpace => "reclaim_space",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("injected failure in {0}")]
struct InjectedFailure(&'static str);

type RebuildHook = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Default)]
struct State {
    indexes: Vec<IndexInfo>,
    usage: IndexUsage,
    tables: BTreeMap<String, TableStats>,
    foreign_keys: Vec<ForeignKeyColumn>,
    queries: Vec<QueryStats>,
    sizes: Vec<TableSize>,
    /// Operation -> number of calls that still succeed before failing
    failures: HashMap<CatalogOp, usize>,
    failing_rebuilds: HashSet<String>,
    failing_lookups: HashSet<(String, String)>,
    delays: HashMap<CatalogOp, Duration>,
    calls: HashMap<CatalogOp, usize>,
    executed: Vec<String>,
    rebuild_hook: Option<RebuildHook>,
}

/// Catalog backed by plain vectors and maps. Cloning shares the state.
#[derive(Clone)]
pub struct MemoryCatalog {
    state: Arc<Mutex<State>>,
    excluded_table_prefixes: Vec<String>,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCatalog")
            .field("excluded_table_prefixes", &self.excluded_table_prefixes)
            .finish_non_exhaustive()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self {
            state: Arc::default(),
            excluded_table_prefixes: vec!["pg_".to_string()],
        }
    }

    fn with_state(self, f: impl FnOnce(&mut State)) -> Self {
        if let Ok(mut state) = self.state.lock() {
            f(&mut state);
        }
        self
    }

    pub fn with_index(self, index: IndexInfo) -> Self {
        self.with_state(|s| s.indexes.push(index))
    }

    pub fn with_usage(self, table: &str, index: &str, scans: i64) -> Self {
        self.with_state(|s| s.usage.insert(IndexKey::new(table, index), scans))
    }

    pub fn with_table_stats(self, table: &str, stats: TableStats) -> Self {
        self.with_state(|s| {
            s.tables.insert(table.to_string(), stats);
        })
    }

    pub fn with_foreign_key(self, foreign_key: ForeignKeyColumn) -> Self {
        self.with_state(|s| s.foreign_keys.push(foreign_key))
    }

    pub fn with_query(self, query: QueryStats) -> Self {
        self.with_state(|s| s.queries.push(query))
    }

    pub fn with_table_size(self, size: TableSize) -> Self {
        self.with_state(|s| s.sizes.push(size))
    }

    /// Make every call to `op` fail.
    pub fn fail_on(self, op: CatalogOp) -> Self {
        self.fail_after(op, 0)
    }

    /// Let `successes` calls to `op` succeed, then fail every later call.
    pub fn fail_after(self, op: CatalogOp, successes: usize) -> Self {
        self.with_state(|s| {
            s.failures.insert(op, successes);
        })
    }

    /// Make `REINDEX TABLE table` fail.
    pub fn fail_rebuild(self, table: &str) -> Self {
        self.with_state(|s| {
            s.failing_rebuilds.insert(table.to_string());
        })
    }

    /// Make the covering-index lookup for `table.column` fail.
    pub fn fail_lookup(self, table: &str, column: &str) -> Self {
        self.with_state(|s| {
            s.failing_lookups
                .insert((table.to_string(), column.to_string()));
        })
    }

    /// Delay every call to `op` by `delay` before answering.
    pub fn with_delay(self, op: CatalogOp, delay: Duration) -> Self {
        self.with_state(|s| {
            s.delays.insert(op, delay);
        })
    }

    /// Run `hook` with the table name after each successful rebuild.
    pub fn on_rebuild(self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.with_state(|s| s.rebuild_hook = Some(Arc::new(hook)))
    }

    /// Maintenance statements executed so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.executed.clone())
            .unwrap_or_default()
    }

    /// Number of calls made to `op`, failed ones included
    pub fn calls(&self, op: CatalogOp) -> usize {
        self.state
            .lock()
            .map(|s| s.calls.get(&op).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Count the call and run `read` unless a failure is scripted for it.
    async fn answer<T>(&self, op: CatalogOp, read: impl FnOnce(&State) -> T) -> Result<T> {
        let delay = {
            let mut state = self.lock()?;
            *state.calls.entry(op).or_default() += 1;
            state.delays.get(&op).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock()?;
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining == 0 {
                return Err(Self::failure(op));
            }
            *remaining -= 1;
        }
        Ok(read(&state))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| OptimizerError::catalog_read("lock", InjectedFailure("poisoned state")))
    }

    fn failure(op: CatalogOp) -> OptimizerError {
        match op {
            CatalogOp::RefreshStatistics => OptimizerError::statement("ANALYZE", InjectedFailure(op.name())),
            CatalogOp::ReclaimSpace => OptimizerError::statement("VACUUM", InjectedFailure(op.name())),
            _ => OptimizerError::catalog_read(op.name(), InjectedFailure(op.name())),
        }
    }

    fn is_excluded(&self, table: &str) -> bool {
        self.excluded_table_prefixes
            .iter()
            .any(|prefix| table.starts_with(prefix.as_str()))
    }

    fn execute(&self, op: CatalogOp, statement: &str) -> Result<()> {
        let mut state = self.lock()?;
        *state.calls.entry(op).or_default() += 1;
        if let Some(remaining) = state.failures.get_mut(&op) {
            if *remaining == 0 {
                return Err(Self::failure(op));
            }
            *remaining -= 1;
        }
        state.executed.push(statement.to_string());
        Ok(())
    }
}

#[async_trait]
impl CatalogReader for MemoryCatalog {
    async fn list_indexes(&self) -> Result<Vec<IndexInfo>> {
        let mut indexes = self
            .answer(CatalogOp::ListIndexes, |s| s.indexes.clone())
            .await?;
        indexes.retain(|index| !self.is_excluded(&index.table_name));
        indexes.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(indexes)
    }

    async fn index_usage(&self) -> Result<IndexUsage> {
        self.answer(CatalogOp::IndexUsage, |s| s.usage.clone()).await
    }

    async fn table_statistics(&self) -> Result<BTreeMap<String, TableStats>> {
        let mut tables = self
            .answer(CatalogOp::TableStatistics, |s| s.tables.clone())
            .await?;
        tables.retain(|table, _| !self.is_excluded(table));
        Ok(tables)
    }

    async fn foreign_key_columns(&self) -> Result<Vec<ForeignKeyColumn>> {
        self.answer(CatalogOp::ForeignKeyColumns, |s| s.foreign_keys.clone())
            .await
    }

    async fn index_exists_on_column(&self, table: &str, column: &str) -> Result<bool> {
        let (failing, exists) = self
            .answer(CatalogOp::IndexExistsOnColumn, |s| {
                let failing = s
                    .failing_lookups
                    .contains(&(table.to_string(), column.to_string()));
                let exists = s
                    .indexes
                    .iter()
                    .any(|index| index.table_name == table && index.supports_lookup_on(column));
                (failing, exists)
            })
            .await?;
        if failing {
            return Err(OptimizerError::catalog_read(
                "index_exists_on_column",
                InjectedFailure("index_exists_on_column"),
            ));
        }
        Ok(exists)
    }

    async fn query_statistics(
        &self,
        min_mean_exec_time_ms: f64,
        limit: usize,
    ) -> Result<Vec<QueryStats>> {
        let mut queries = self
            .answer(CatalogOp::QueryStatistics, |s| s.queries.clone())
            .await?;
        queries.retain(|q| q.mean_exec_time_ms > min_mean_exec_time_ms);
        queries.sort_by(|a, b| b.mean_exec_time_ms.total_cmp(&a.mean_exec_time_ms));
        queries.truncate(limit);
        Ok(queries)
    }

    async fn table_sizes(&self) -> Result<Vec<TableSize>> {
        let mut sizes = self
            .answer(CatalogOp::TableSizes, |s| s.sizes.clone())
            .await?;
        sizes.retain(|size| !self.is_excluded(&size.table));
        Ok(sizes)
    }
}

#[async_trait]
impl MaintenanceExecutor for MemoryCatalog {
    async fn refresh_statistics(&self) -> Result<()> {
        self.execute(CatalogOp::RefreshStatistics, "ANALYZE")
    }

    async fn reclaim_space(&self) -> Result<()> {
        self.execute(CatalogOp::ReclaimSpace, "VACUUM")
    }

    async fn rebuild_table_indexes(&self, table: &str) -> Result<()> {
        let statement = format!("REINDEX TABLE {}", super::quote_ident(table));
        let hook = {
            let mut state = self.lock()?;
            if state.failing_rebuilds.contains(table) {
                return Err(OptimizerError::statement(
                    statement,
                    InjectedFailure("rebuild_table_indexes"),
                ));
            }
            state.executed.push(statement);
            state.rebuild_hook.clone()
        };
        if let Some(hook) = hook {
            hook(table);
        }
        Ok(())
    }
}
