//! PostgreSQL implementation of the catalog traits.
//!
//! All reads go to `pg_catalog` and the cumulative statistics views, scoped to
//! one schema that is bound as a query parameter. Maintenance statements are
//! sent with the simple query protocol straight to the pool, so each one runs
//! in its own implicit transaction; `VACUUM` and `REINDEX` refuse to run
//! inside an explicit transaction block.
//!
//! ## Catalog Sources
//!
//! | Operation | Source |
//! |---|---|
//! | `list_indexes` | `pg_index`, `pg_class`, `pg_am`, `pg_attribute` |
//! | `index_usage` | `pg_stat_user_indexes` |
//! | `table_statistics` | `pg_stat_user_tables` |
//! | `foreign_key_columns` | `pg_constraint` (`contype = 'f'`) |
//! | `query_statistics` | `pg_stat_statements` (extension must be installed) |
//! | `table_sizes` | `pg_total_relation_size`, `pg_indexes_size` |
//!
//! Indexes on partitioned parents are skipped: the statistics views only
//! count scans on the partitions, so the parent index would always look unused.

use super::{
    CatalogReader, ForeignKeyColumn, IndexInfo, IndexKey, IndexUsage, MaintenanceExecutor,
    PoolStatus, QueryStats, TableSize, TableStats, quote_ident,
};
use crate::config::OptimizerConfig;
use crate::error::{OptimizerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// `server_version_num` of the first release whose `pg_stat_user_indexes`
/// carries `last_idx_scan`
const LAST_IDX_SCAN_SINCE: i32 = 160_000;

const LIST_INDEXES: &str = r#"
    SELECT
        t.relname::text AS table_name,
        i.relname::text AS index_name,
        am.amname::text AS index_type,
        ix.indisunique AS is_unique,
        ix.indisprimary AS is_primary,
        pg_relation_size(i.oid) AS size_bytes,
        ARRAY(
            SELECT COALESCE(a.attname::text, pg_get_indexdef(ix.indexrelid, k.ord::int, true))
            FROM unnest(ix.indkey::int2[]) WITH ORDINALITY AS k(attnum, ord)
            LEFT JOIN pg_attribute a
                ON a.attrelid = ix.indrelid AND a.attnum = k.attnum AND k.attnum > 0
            WHERE k.ord <= ix.indnkeyatts
            ORDER BY k.ord
        ) AS columns
    FROM pg_class t
    JOIN pg_namespace n ON n.oid = t.relnamespace
    JOIN pg_index ix ON ix.indrelid = t.oid
    JOIN pg_class i ON i.oid = ix.indexrelid
    JOIN pg_am am ON am.oid = i.relam
    WHERE t.relkind = 'r'
      AND n.nspname = $1
    ORDER BY t.relname, i.relname
"#;

const LAST_INDEX_SCANS: &str = r#"
    SELECT relname::text AS table_name, indexrelname::text AS index_name, last_idx_scan
    FROM pg_stat_user_indexes
    WHERE schemaname = $1
"#;

const INDEX_USAGE: &str = r#"
    SELECT relname::text AS table_name, indexrelname::text AS index_name, idx_scan AS scans
    FROM pg_stat_user_indexes
    WHERE schemaname = $1
"#;

const TABLE_STATISTICS: &str = r#"
    SELECT
        relname::text AS table_name,
        n_tup_ins AS inserts,
        n_tup_upd AS updates,
        n_tup_del AS deletes,
        n_live_tup AS live_tuples,
        n_dead_tup AS dead_tuples,
        last_vacuum,
        last_autovacuum,
        last_analyze,
        last_autoanalyze
    FROM pg_stat_user_tables
    WHERE schemaname = $1
"#;

// Only the first referencing column of each constraint: an index led by it is
// what serves the join and the cascade lookup.
const FOREIGN_KEY_COLUMNS: &str = r#"
    SELECT
        cl.relname::text AS table_name,
        a.attname::text AS column_name,
        rcl.relname::text AS referenced_table,
        ra.attname::text AS referenced_column
    FROM pg_constraint c
    JOIN pg_class cl ON cl.oid = c.conrelid
    JOIN pg_namespace n ON n.oid = cl.relnamespace
    JOIN pg_class rcl ON rcl.oid = c.confrelid
    JOIN pg_attribute a ON a.attrelid = c.conrelid AND a.attnum = c.conkey[1]
    JOIN pg_attribute ra ON ra.attrelid = c.confrelid AND ra.attnum = c.confkey[1]
    WHERE c.contype = 'f'
      AND n.nspname = $1
    ORDER BY cl.relname, a.attname
"#;

const LEADING_INDEX_COLUMNS: &str = r#"
    SELECT a.attname::text AS leading_column
    FROM pg_index ix
    JOIN pg_class t ON t.oid = ix.indrelid
    JOIN pg_namespace n ON n.oid = t.relnamespace
    LEFT JOIN pg_attribute a ON a.attrelid = ix.indrelid AND a.attnum = ix.indkey[0]
    WHERE n.nspname = $1
      AND t.relname = $2
"#;

const QUERY_STATISTICS: &str = r#"
    SELECT
        s.query,
        s.mean_exec_time,
        s.total_exec_time,
        s.calls,
        s.rows
    FROM pg_stat_statements s
    JOIN pg_database d ON d.oid = s.dbid
    WHERE d.datname = current_database()
      AND s.mean_exec_time > $1
    ORDER BY s.mean_exec_time DESC
    LIMIT $2
"#;

const TABLE_SIZES: &str = r#"
    SELECT
        relname::text AS table_name,
        pg_total_relation_size(relid) AS total_bytes,
        pg_relation_size(relid) AS table_bytes,
        pg_indexes_size(relid) AS index_bytes
    FROM pg_stat_user_tables
    WHERE schemaname = $1
    ORDER BY total_bytes DESC, relname
"#;

/// Catalog reader and maintenance executor backed by a PostgreSQL pool.
#[derive(Clone, Debug)]
pub struct PgCatalog {
    pool: PgPool,
    config: OptimizerConfig,
}

impl PgCatalog {
    /// Connect to `database_url` with a small pool dedicated to catalog work.
    pub async fn connect(database_url: &str, config: &OptimizerConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| OptimizerError::catalog_read("connect", e))?;
        Ok(Self::from_pool(pool, config))
    }

    /// Wrap a pool owned by the host.
    pub fn from_pool(pool: PgPool, config: &OptimizerConfig) -> Self {
        Self {
            pool,
            config: config.clone(),
        }
    }

    pub fn schema(&self) -> &str {
        &self.config.schema
    }

    fn is_excluded(&self, table: &str) -> bool {
        self.config.is_excluded_table(table)
    }

    async fn fetch(&self, operation: &'static str, sql: &'static str) -> Result<Vec<PgRow>> {
        sqlx::query(sql)
            .bind(&self.config.schema)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OptimizerError::catalog_read(operation, e))
    }

    async fn server_version_num(&self) -> Result<i32> {
        let version: String = sqlx::query_scalar("SELECT current_setting('server_version_num')")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| OptimizerError::catalog_read("server_version_num", e))?;
        Ok(version.trim().parse().unwrap_or(0))
    }

    async fn last_index_scans(&self) -> Result<BTreeMap<IndexKey, DateTime<Utc>>> {
        if self.server_version_num().await? < LAST_IDX_SCAN_SINCE {
            return Ok(BTreeMap::new());
        }
        let rows = self.fetch("list_indexes", LAST_INDEX_SCANS).await?;
        let mut scans = BTreeMap::new();
        for row in rows {
            let key = IndexKey::new(
                get::<String>(&row, "list_indexes", "table_name")?,
                get::<String>(&row, "list_indexes", "index_name")?,
            );
            if let Some(at) = get::<Option<DateTime<Utc>>>(&row, "list_indexes", "last_idx_scan")? {
                scans.insert(key, at);
            }
        }
        Ok(scans)
    }

    async fn execute(&self, statement: &str) -> Result<()> {
        debug!("Executing maintenance statement: {}", statement);
        sqlx::raw_sql(statement)
            .execute(&self.pool)
            .await
            .map_err(|e| OptimizerError::statement(statement, e))?;
        Ok(())
    }
}

fn get<'r, T>(row: &'r PgRow, operation: &'static str, column: &str) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get(column)
        .map_err(|e| OptimizerError::catalog_read(operation, e))
}

#[async_trait]
impl CatalogReader for PgCatalog {
    async fn list_indexes(&self) -> Result<Vec<IndexInfo>> {
        const OP: &str = "list_indexes";
        let rows = self.fetch(OP, LIST_INDEXES).await?;
        let last_scans = self.last_index_scans().await?;

        let mut indexes = Vec::with_capacity(rows.len());
        for row in rows {
            let table_name: String = get(&row, OP, "table_name")?;
            if self.is_excluded(&table_name) {
                continue;
            }
            let index_name: String = get(&row, OP, "index_name")?;
            let last_used = last_scans
                .get(&IndexKey::new(&table_name, &index_name))
                .copied();
            indexes.push(IndexInfo {
                table_name,
                index_name,
                columns: get::<Option<Vec<String>>>(&row, OP, "columns")?.unwrap_or_default(),
                index_type: get(&row, OP, "index_type")?,
                is_unique: get(&row, OP, "is_unique")?,
                is_primary: get(&row, OP, "is_primary")?,
                size_bytes: get::<Option<i64>>(&row, OP, "size_bytes")?.unwrap_or(0),
                last_used,
            });
        }
        debug!("Read {} indexes from schema {}", indexes.len(), self.config.schema);
        Ok(indexes)
    }

    async fn index_usage(&self) -> Result<IndexUsage> {
        const OP: &str = "index_usage";
        let rows = self.fetch(OP, INDEX_USAGE).await?;
        let mut usage = IndexUsage::new();
        for row in rows {
            usage.insert(
                IndexKey::new(
                    get::<String>(&row, OP, "table_name")?,
                    get::<String>(&row, OP, "index_name")?,
                ),
                get::<Option<i64>>(&row, OP, "scans")?.unwrap_or(0),
            );
        }
        Ok(usage)
    }

    async fn table_statistics(&self) -> Result<BTreeMap<String, TableStats>> {
        const OP: &str = "table_statistics";
        let rows = self.fetch(OP, TABLE_STATISTICS).await?;
        let mut stats = BTreeMap::new();
        for row in rows {
            let table: String = get(&row, OP, "table_name")?;
            if self.is_excluded(&table) {
                continue;
            }
            let counter = |column: &str| -> Result<i64> {
                Ok(get::<Option<i64>>(&row, OP, column)?.unwrap_or(0))
            };
            let table_stats = TableStats {
                inserts: counter("inserts")?,
                updates: counter("updates")?,
                deletes: counter("deletes")?,
                live_tuples: counter("live_tuples")?,
                dead_tuples: counter("dead_tuples")?,
                last_vacuum: get(&row, OP, "last_vacuum")?,
                last_autovacuum: get(&row, OP, "last_autovacuum")?,
                last_analyze: get(&row, OP, "last_analyze")?,
                last_autoanalyze: get(&row, OP, "last_autoanalyze")?,
            };
            stats.insert(table, table_stats);
        }
        Ok(stats)
    }

    async fn foreign_key_columns(&self) -> Result<Vec<ForeignKeyColumn>> {
        const OP: &str = "foreign_key_columns";
        let rows = self.fetch(OP, FOREIGN_KEY_COLUMNS).await?;
        rows.iter()
            .map(|row| {
                Ok(ForeignKeyColumn {
                    table: get(row, OP, "table_name")?,
                    column: get(row, OP, "column_name")?,
                    referenced_table: get(row, OP, "referenced_table")?,
                    referenced_column: get(row, OP, "referenced_column")?,
                })
            })
            .collect()
    }

    async fn index_exists_on_column(&self, table: &str, column: &str) -> Result<bool> {
        const OP: &str = "index_exists_on_column";
        let leading: Vec<Option<String>> = sqlx::query_scalar(LEADING_INDEX_COLUMNS)
            .bind(&self.config.schema)
            .bind(table)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OptimizerError::catalog_read(OP, e))?;
        Ok(leading.iter().flatten().any(|name| name == column))
    }

    async fn query_statistics(
        &self,
        min_mean_exec_time_ms: f64,
        limit: usize,
    ) -> Result<Vec<QueryStats>> {
        const OP: &str = "query_statistics";
        let rows = sqlx::query(QUERY_STATISTICS)
            .bind(min_mean_exec_time_ms)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| OptimizerError::catalog_read(OP, e))?;

        rows.iter()
            .map(|row| {
                Ok(QueryStats {
                    query: get::<Option<String>>(row, OP, "query")?.unwrap_or_default(),
                    mean_exec_time_ms: get::<Option<f64>>(row, OP, "mean_exec_time")?
                        .unwrap_or(0.0),
                    total_exec_time_ms: get::<Option<f64>>(row, OP, "total_exec_time")?
                        .unwrap_or(0.0),
                    calls: get::<Option<i64>>(row, OP, "calls")?.unwrap_or(0),
                    rows: get::<Option<i64>>(row, OP, "rows")?.unwrap_or(0),
                    // pg_stat_statements does not track per-statement execution time points
                    last_executed: None,
                })
            })
            .collect()
    }

    async fn table_sizes(&self) -> Result<Vec<TableSize>> {
        const OP: &str = "table_sizes";
        let rows = self.fetch(OP, TABLE_SIZES).await?;
        let mut sizes = Vec::with_capacity(rows.len());
        for row in rows {
            let table: String = get(&row, OP, "table_name")?;
            if self.is_excluded(&table) {
                continue;
            }
            sizes.push(TableSize {
                table,
                total_bytes: get::<Option<i64>>(&row, OP, "total_bytes")?.unwrap_or(0),
                table_bytes: get::<Option<i64>>(&row, OP, "table_bytes")?.unwrap_or(0),
                index_bytes: get::<Option<i64>>(&row, OP, "index_bytes")?.unwrap_or(0),
            });
        }
        Ok(sizes)
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        let open_connections = self.pool.size();
        let idle = u32::try_from(self.pool.num_idle()).unwrap_or(u32::MAX);
        Some(PoolStatus {
            max_connections: self.pool.options().get_max_connections(),
            open_connections,
            in_use: open_connections.saturating_sub(idle),
            idle,
        })
    }
}

#[async_trait]
impl MaintenanceExecutor for PgCatalog {
    async fn refresh_statistics(&self) -> Result<()> {
        self.execute("ANALYZE").await
    }

    async fn reclaim_space(&self) -> Result<()> {
        self.execute("VACUUM").await
    }

    async fn rebuild_table_indexes(&self, table: &str) -> Result<()> {
        let statement = format!(
            "REINDEX TABLE {}.{}",
            quote_ident(&self.config.schema),
            quote_ident(table)
        );
        self.execute(&statement).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // connect_lazy never opens a connection, so these run without a server
    fn lazy_catalog(config: &OptimizerConfig) -> anyhow::Result<PgCatalog> {
        let pool = PgPoolOptions::new().connect_lazy("postgres://localhost/db_optimizer_test")?;
        Ok(PgCatalog::from_pool(pool, config))
    }

    #[tokio::test]
    async fn takes_schema_and_exclusions_from_config() -> anyhow::Result<()> {
        let config = OptimizerConfig::new("billing")
            .with_excluded_table_prefixes(vec!["pg_".to_string(), "_sqlx".to_string()]);
        let catalog = lazy_catalog(&config)?;

        assert_eq!(catalog.schema(), "billing");
        assert!(catalog.is_excluded("_sqlx_migrations"));
        assert!(catalog.is_excluded("pg_toast_2619"));
        assert!(!catalog.is_excluded("invoices"));
        Ok(())
    }

    #[test]
    fn catalog_queries_are_schema_scoped() {
        for sql in [
            LIST_INDEXES,
            LAST_INDEX_SCANS,
            INDEX_USAGE,
            TABLE_STATISTICS,
            FOREIGN_KEY_COLUMNS,
            LEADING_INDEX_COLUMNS,
            TABLE_SIZES,
        ] {
            assert!(sql.contains("$1"), "query is not parameterized: {sql}");
        }
        assert!(!LEADING_INDEX_COLUMNS.contains("LIKE"));
    }

    #[test]
    fn partitioned_parents_are_not_listed() {
        assert!(LIST_INDEXES.contains("t.relkind = 'r'"));
        assert!(!LIST_INDEXES.contains("'p'"));
    }

    #[tokio::test]
    async fn pool_status_reports_configured_limit() -> anyhow::Result<()> {
        let pool = PgPoolOptions::new()
            .max_connections(3)
            .connect_lazy("postgres://localhost/db_optimizer_test")?;
        let catalog = PgCatalog::from_pool(pool, &OptimizerConfig::default());

        let status = catalog.pool_status();
        assert_eq!(
            status,
            Some(PoolStatus {
                max_connections: 3,
                open_connections: 0,
                in_use: 0,
                idle: 0,
            })
        );
        Ok(())
    }
}
