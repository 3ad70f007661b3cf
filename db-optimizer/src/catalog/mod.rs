//! Catalog access layer for db-optimizer
//!
//! This module defines the typed snapshots the engine reads from the database
//! catalogs and the two capabilities it consumes from its host: read-only
//! catalog access and maintenance statement execution. Keeping them as two
//! traits means a caller that only analyzes never holds the ability to run
//! `VACUUM` or `REINDEX`.
//!
//! ## Key Components
//!
//! - **CatalogReader**: indexes, usage counters, table statistics, foreign keys,
//!   statement statistics and relation sizes
//! - **MaintenanceExecutor**: `ANALYZE`, `VACUUM` and `REINDEX TABLE`
//! - **Data Types**: IndexInfo, IndexUsage, TableStats, ForeignKeyColumn, QueryStats,
//!   TableSize, PoolStatus
//!
//! ## Architecture
//!
//! ```text
//! CatalogReader ──────┐
//!                     ├─ PgCatalog (sqlx, PostgreSQL)
//! MaintenanceExecutor ┘
//!                     └─ MemoryCatalog (in-memory, scripted failures)
//! ```

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

pub mod memory;
pub mod postgres;

pub use memory::{CatalogOp, MemoryCatalog};
pub use postgres::PgCatalog;

/// Composite key identifying an index within the application schema.
///
/// Index names are only unique per schema in PostgreSQL, and usage views are
/// reported per table, so lookups always go through `(table, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexKey {
    pub table: String,
    pub index: String,
}

impl IndexKey {
    pub fn new(table: impl Into<String>, index: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            index: index.into(),
        }
    }
}

/// Metadata for one index on a user table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub table_name: String,
    pub index_name: String,
    /// Ordered key columns; expression keys appear as their definition text
    pub columns: Vec<String>,
    /// Access method, e.g. `btree`, `hash`, `gin`
    pub index_type: String,
    pub is_unique: bool,
    pub is_primary: bool,
    pub size_bytes: i64,
    pub last_used: Option<DateTime<Utc>>,
}

impl IndexInfo {
    /// A plain, non-unique btree index on `columns`.
    pub fn new(table: impl Into<String>, index: impl Into<String>, columns: &[&str]) -> Self {
        Self {
            table_name: table.into(),
            index_name: index.into(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            index_type: "btree".to_string(),
            is_unique: false,
            is_primary: false,
            size_bytes: 0,
            last_used: None,
        }
    }

    /// Mark the index as the table's primary key (implies unique).
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self.is_unique = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn with_type(mut self, index_type: impl Into<String>) -> Self {
        self.index_type = index_type.into();
        self
    }

    pub fn with_size(mut self, size_bytes: i64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    pub fn key(&self) -> IndexKey {
        IndexKey::new(&self.table_name, &self.index_name)
    }

    /// The indexed column: first entry of the ordered column list.
    pub fn leading_column(&self) -> Option<&str> {
        self.columns.first().map(String::as_str)
    }

    /// Whether lookups on `column` alone can use this index.
    pub fn supports_lookup_on(&self, column: &str) -> bool {
        self.leading_column() == Some(column)
    }
}

/// Scan counters since the last statistics reset, keyed by [`IndexKey`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexUsage(HashMap<IndexKey, i64>);

impl IndexUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: IndexKey, scans: i64) {
        self.0.insert(key, scans);
    }

    /// Scan count for `key`; an index the statistics view does not report has
    /// never been scanned.
    pub fn scans(&self, key: &IndexKey) -> i64 {
        self.0.get(key).copied().unwrap_or(0)
    }
}

impl FromIterator<(IndexKey, i64)> for IndexUsage {
    fn from_iter<I: IntoIterator<Item = (IndexKey, i64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Write and bloat counters for one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub inserts: i64,
    pub updates: i64,
    pub deletes: i64,
    pub live_tuples: i64,
    pub dead_tuples: i64,
    pub last_vacuum: Option<DateTime<Utc>>,
    pub last_autovacuum: Option<DateTime<Utc>>,
    pub last_analyze: Option<DateTime<Utc>>,
    pub last_autoanalyze: Option<DateTime<Utc>>,
}

impl TableStats {
    pub fn with_tuples(live_tuples: i64, dead_tuples: i64) -> Self {
        Self {
            live_tuples,
            dead_tuples,
            ..Self::default()
        }
    }

    /// Dead tuples divided by live tuples, `None` when the table has no live rows.
    pub fn dead_tuple_ratio(&self) -> Option<f64> {
        if self.live_tuples <= 0 {
            return None;
        }
        Some(self.dead_tuples as f64 / self.live_tuples as f64)
    }
}

/// One referencing column of a foreign-key constraint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ForeignKeyColumn {
    pub table: String,
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

impl ForeignKeyColumn {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        referenced_table: impl Into<String>,
        referenced_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
            referenced_table: referenced_table.into(),
            referenced_column: referenced_column.into(),
        }
    }
}

/// Aggregated execution statistics for one normalized statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub query: String,
    pub mean_exec_time_ms: f64,
    pub total_exec_time_ms: f64,
    pub calls: i64,
    pub rows: i64,
    pub last_executed: Option<DateTime<Utc>>,
}

impl QueryStats {
    pub fn new(query: impl Into<String>, mean_exec_time_ms: f64, calls: i64) -> Self {
        Self {
            query: query.into(),
            mean_exec_time_ms,
            total_exec_time_ms: mean_exec_time_ms * calls as f64,
            calls,
            rows: 0,
            last_executed: None,
        }
    }

    pub fn mean_duration(&self) -> Duration {
        Duration::try_from_secs_f64(self.mean_exec_time_ms.max(0.0) / 1000.0)
            .unwrap_or(Duration::MAX)
    }
}

/// On-disk footprint of one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSize {
    pub table: String,
    /// Heap, indexes and TOAST together
    pub total_bytes: i64,
    pub table_bytes: i64,
    pub index_bytes: i64,
}

/// Connection counters of the pool the catalog reads through.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub max_connections: u32,
    pub open_connections: u32,
    pub in_use: u32,
    pub idle: u32,
}

/// Read-only access to catalog metadata and runtime statistics.
///
/// Implementations must not mutate anything and must be safe to call from
/// independent callers at the same time.
#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// Indexes on user tables, internal tables excluded by name convention
    async fn list_indexes(&self) -> Result<Vec<IndexInfo>>;

    /// Scan counters for every index in the application schema
    async fn index_usage(&self) -> Result<IndexUsage>;

    /// Write and bloat counters keyed by table name
    async fn table_statistics(&self) -> Result<BTreeMap<String, TableStats>>;

    /// Referencing columns of every foreign key in the application schema
    async fn foreign_key_columns(&self) -> Result<Vec<ForeignKeyColumn>>;

    /// Whether some index on `table` has `column` as its leading column
    async fn index_exists_on_column(&self, table: &str, column: &str) -> Result<bool>;

    /// Statement statistics with a mean above `min_mean_exec_time_ms`, slowest first
    async fn query_statistics(
        &self,
        min_mean_exec_time_ms: f64,
        limit: usize,
    ) -> Result<Vec<QueryStats>>;

    /// Relation sizes of every user table
    async fn table_sizes(&self) -> Result<Vec<TableSize>>;

    /// Pool counters, for readers backed by a connection pool
    fn pool_status(&self) -> Option<PoolStatus> {
        None
    }
}

/// Execution of maintenance statements.
///
/// Every statement runs in autocommit mode outside any caller transaction.
#[async_trait]
pub trait MaintenanceExecutor: Send + Sync {
    /// Recompute planner statistics for all tables
    async fn refresh_statistics(&self) -> Result<()>;

    /// Reclaim space held by dead tuples across all tables
    async fn reclaim_space(&self) -> Result<()>;

    /// Rebuild every index of `table`
    async fn rebuild_table_indexes(&self, table: &str) -> Result<()>;
}

// Reserved words that commonly show up as table or column names
const RESERVED_WORDS: &[&str] = &[
    "all", "analyse", "analyze", "and", "any", "array", "as", "asc", "both", "case", "cast",
    "check", "collate", "column", "constraint", "create", "default", "desc", "distinct", "do",
    "else", "end", "except", "false", "for", "foreign", "from", "grant", "group", "having", "in",
    "into", "leading", "limit", "not", "null", "offset", "on", "only", "or", "order", "primary",
    "references", "select", "table", "then", "to", "true", "union", "unique", "user", "using",
    "when", "where", "window", "with",
];

/// Quote `name` as a PostgreSQL identifier when it is not a plain lowercase,
/// non-reserved name.
pub fn quote_ident(name: &str) -> String {
    let mut chars = name.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && !RESERVED_WORDS.contains(&name);
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_tuple_ratio_needs_live_rows() {
        assert_eq!(TableStats::with_tuples(1000, 250).dead_tuple_ratio(), Some(0.25));
        assert_eq!(TableStats::with_tuples(0, 50).dead_tuple_ratio(), None);
        assert_eq!(TableStats::with_tuples(10, 0).dead_tuple_ratio(), Some(0.0));
    }

    #[test]
    fn usage_lookup_is_per_table() {
        let usage: IndexUsage = [
            (IndexKey::new("orders", "idx_created_at"), 12),
            (IndexKey::new("events", "idx_created_at"), 0),
        ]
        .into_iter()
        .collect();

        assert_eq!(usage.scans(&IndexKey::new("orders", "idx_created_at")), 12);
        assert_eq!(usage.scans(&IndexKey::new("events", "idx_created_at")), 0);
        assert_eq!(usage.scans(&IndexKey::new("users", "idx_created_at")), 0);
    }

    #[test]
    fn lookup_support_is_leading_column_only() {
        let index = IndexInfo::new("orders", "idx_orders_customer_status", &["customer_id", "status"]);
        assert!(index.supports_lookup_on("customer_id"));
        assert!(!index.supports_lookup_on("status"));
        // substring of an indexed column name
        assert!(!index.supports_lookup_on("customer"));
        assert!(!IndexInfo::new("t", "idx_expr", &[]).supports_lookup_on("customer_id"));
    }

    #[test]
    fn identifiers_are_quoted_when_needed() {
        assert_eq!(quote_ident("orders"), "orders");
        assert_eq!(quote_ident("_audit_2024"), "_audit_2024");
        assert_eq!(quote_ident("customerId"), "\"customerId\"");
        assert_eq!(quote_ident("order items"), "\"order items\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_ident("1st"), "\"1st\"");
        assert_eq!(quote_ident("user"), "\"user\"");
        assert_eq!(quote_ident("user_id"), "user_id");
    }

    #[test]
    fn mean_duration_converts_milliseconds() {
        let stats = QueryStats::new("SELECT 1", 1500.0, 4);
        assert_eq!(stats.mean_duration(), Duration::from_millis(1500));
        assert_eq!(stats.total_exec_time_ms, 6000.0);
    }
}
