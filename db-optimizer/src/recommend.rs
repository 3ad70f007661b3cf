//! Index recommendation heuristics.
//!
//! Three independent passes over catalog snapshots, each a pure function, plus
//! [`IndexAdvisor`] which reads the snapshots and isolates pass failures.
//!
//! | Pass | Emits | Severity | Failure |
//! |---|---|---|---|
//! | unused | `unused_index` | medium | fatal (it reads the base data) |
//! | missing FK | `missing_fk_index` | high | logged, pass omitted |
//! | duplicate | `duplicate_index` | medium | logged, pass omitted |

use crate::catalog::{CatalogReader, ForeignKeyColumn, IndexInfo, IndexUsage, quote_ident};
use crate::context::RunContext;
use crate::error::{OptimizerError, Result};
use crate::events::{Event, EventSink};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

pub const MISSING_FK_PASS: &str = "missing_fk_index";
pub const DUPLICATE_PASS: &str = "duplicate_index";

/// What a recommendation is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    UnusedIndex,
    MissingFkIndex,
    DuplicateIndex,
}

impl RecommendationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UnusedIndex => "unused_index",
            Self::MissingFkIndex => "missing_fk_index",
            Self::DuplicateIndex => "duplicate_index",
        }
    }
}

impl fmt::Display for RecommendationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(name)
    }
}

/// One actionable finding about the index layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexRecommendation {
    #[serde(rename = "type")]
    pub kind: RecommendationKind,
    pub severity: Severity,
    pub table: String,
    pub index: Option<String>,
    /// Second member of a duplicate pair
    pub related_index: Option<String>,
    pub column: Option<String>,
    pub description: String,
    pub action: String,
    /// Ready-to-execute statement, when one follows directly from the finding
    pub sql: Option<String>,
}

/// Emit `unused_index` for every non-primary index without a single scan.
pub fn unused_index_recommendations(
    schema: &str,
    indexes: &[IndexInfo],
    usage: &IndexUsage,
) -> Vec<IndexRecommendation> {
    indexes
        .iter()
        .filter(|index| !index.is_primary && usage.scans(&index.key()) == 0)
        .sorted_by(|a, b| a.key().cmp(&b.key()))
        .map(|index| {
            let mut description = format!(
                "Index {} on table {} is not being used",
                index.index_name, index.table_name
            );
            if index.is_unique {
                description.push_str(" (it still enforces uniqueness)");
            }
            IndexRecommendation {
                kind: RecommendationKind::UnusedIndex,
                severity: Severity::Medium,
                table: index.table_name.clone(),
                index: Some(index.index_name.clone()),
                related_index: None,
                column: index.leading_column().map(str::to_string),
                description,
                action: format!("Consider dropping index {}", index.index_name),
                sql: Some(format!(
                    "DROP INDEX IF EXISTS {}.{}",
                    quote_ident(schema),
                    quote_ident(&index.index_name)
                )),
            }
        })
        .collect()
}

/// Deterministic name for the index supporting `table.column`.
pub fn fk_index_name(table: &str, column: &str) -> String {
    format!("idx_{table}_{column}")
}

/// `missing_fk_index` for a foreign-key column without a supporting index.
pub fn missing_fk_recommendation(schema: &str, fk: &ForeignKeyColumn) -> IndexRecommendation {
    let index_name = fk_index_name(&fk.table, &fk.column);
    IndexRecommendation {
        kind: RecommendationKind::MissingFkIndex,
        severity: Severity::High,
        table: fk.table.clone(),
        index: None,
        related_index: None,
        column: Some(fk.column.clone()),
        description: format!(
            "Foreign key {}.{} references {}.{} but has no index",
            fk.table, fk.column, fk.referenced_table, fk.referenced_column
        ),
        action: format!("Create index on {}.{}", fk.table, fk.column),
        sql: Some(format!(
            "CREATE INDEX {} ON {}.{} ({})",
            quote_ident(&index_name),
            quote_ident(schema),
            quote_ident(&fk.table),
            quote_ident(&fk.column)
        )),
    }
}

/// One `duplicate_index` per unordered pair of indexes on the same table with
/// an identical ordered column list. Access method is not compared.
pub fn duplicate_index_recommendations(indexes: &[IndexInfo]) -> Vec<IndexRecommendation> {
    indexes
        .iter()
        .filter(|index| !index.columns.is_empty())
        .sorted_by(|a, b| {
            (&a.table_name, &a.columns, &a.index_name).cmp(&(
                &b.table_name,
                &b.columns,
                &b.index_name,
            ))
        })
        .dedup_by(|a, b| a.key() == b.key())
        .chunk_by(|index| (index.table_name.clone(), index.columns.clone()))
        .into_iter()
        .flat_map(|((table, columns), group)| {
            group
                .collect_vec()
                .into_iter()
                .tuple_combinations()
                .map(|(first, second)| duplicate_recommendation(&table, &columns, first, second))
                .collect::<Vec<_>>()
        })
        .collect()
}

fn duplicate_recommendation(
    table: &str,
    columns: &[String],
    first: &IndexInfo,
    second: &IndexInfo,
) -> IndexRecommendation {
    IndexRecommendation {
        kind: RecommendationKind::DuplicateIndex,
        severity: Severity::Medium,
        table: table.to_string(),
        index: Some(first.index_name.clone()),
        related_index: Some(second.index_name.clone()),
        column: columns.first().cloned(),
        description: format!(
            "Indexes {} and {} on table {} have identical columns ({})",
            first.index_name,
            second.index_name,
            table,
            columns.join(", ")
        ),
        action: format!(
            "Consider dropping one of the duplicate indexes: {} or {}",
            first.index_name, second.index_name
        ),
        sql: None,
    }
}

/// Runs the three recommendation passes against a catalog.
pub struct IndexAdvisor<'a> {
    catalog: &'a dyn CatalogReader,
    events: &'a dyn EventSink,
    ctx: &'a RunContext,
    schema: &'a str,
}

impl<'a> IndexAdvisor<'a> {
    pub fn new(
        catalog: &'a dyn CatalogReader,
        events: &'a dyn EventSink,
        ctx: &'a RunContext,
        schema: &'a str,
    ) -> Self {
        Self {
            catalog,
            events,
            ctx,
            schema,
        }
    }

    /// Unused, missing-FK and duplicate recommendations, in that order.
    ///
    /// Only a failure to read the index list or the usage counters is
    /// returned; the other two passes are dropped with a warning when they fail.
    pub async fn analyze(&self) -> Result<Vec<IndexRecommendation>> {
        let indexes = self
            .ctx
            .run("list_indexes", self.catalog.list_indexes())
            .await?;
        let usage = self
            .ctx
            .run("index_usage", self.catalog.index_usage())
            .await?;

        let mut recommendations = unused_index_recommendations(self.schema, &indexes, &usage);

        match self.missing_fk_pass().await {
            Ok(found) => recommendations.extend(found),
            Err(err) => self.omit_pass(MISSING_FK_PASS, err)?,
        }
        match self.duplicate_pass().await {
            Ok(found) => recommendations.extend(found),
            Err(err) => self.omit_pass(DUPLICATE_PASS, err)?,
        }

        self.events.record(Event::info(format!(
            "Index analysis produced {} recommendations",
            recommendations.len()
        )));
        Ok(recommendations)
    }

    async fn missing_fk_pass(&self) -> Result<Vec<IndexRecommendation>> {
        let mut foreign_keys = self
            .ctx
            .run("foreign_key_columns", self.catalog.foreign_key_columns())
            .await?;
        foreign_keys.sort();

        let mut seen = HashSet::new();
        let mut recommendations = Vec::new();
        for fk in &foreign_keys {
            if !seen.insert((fk.table.as_str(), fk.column.as_str())) {
                continue;
            }
            let exists = self
                .ctx
                .run(
                    "index_exists_on_column",
                    self.catalog.index_exists_on_column(&fk.table, &fk.column),
                )
                .await;
            match exists {
                Ok(true) => {}
                Ok(false) => recommendations.push(missing_fk_recommendation(self.schema, fk)),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => self.events.record(Event::warn(format!(
                    "Failed to check index for {}.{}: {err}",
                    fk.table, fk.column
                ))),
            }
        }
        Ok(recommendations)
    }

    async fn duplicate_pass(&self) -> Result<Vec<IndexRecommendation>> {
        let indexes = self
            .ctx
            .run("list_indexes", self.catalog.list_indexes())
            .await?;
        Ok(duplicate_index_recommendations(&indexes))
    }

    fn omit_pass(&self, pass: &'static str, err: OptimizerError) -> Result<()> {
        if err.is_cancelled() {
            return Err(err);
        }
        let err = OptimizerError::RecommendationPass {
            pass,
            source: Box::new(err),
        };
        self.events
            .record(Event::warn(format!("Skipping {pass} recommendations: {err}")));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::IndexKey;

    fn usage(entries: &[(&str, &str, i64)]) -> IndexUsage {
        entries
            .iter()
            .map(|(table, index, scans)| (IndexKey::new(*table, *index), *scans))
            .collect()
    }

    #[test]
    fn primary_key_is_never_unused() {
        let indexes = vec![IndexInfo::new("users", "pk_users", &["id"]).primary()];
        let found = unused_index_recommendations("public", &indexes, &usage(&[("users", "pk_users", 0)]));
        assert!(found.is_empty());
    }

    #[test]
    fn unscanned_secondary_index_is_unused() {
        let indexes = vec![
            IndexInfo::new("orders", "idx_orders_status", &["status"]),
            IndexInfo::new("orders", "idx_orders_created_at", &["created_at"]),
        ];
        let found = unused_index_recommendations(
            "public",
            &indexes,
            &usage(&[("orders", "idx_orders_status", 0), ("orders", "idx_orders_created_at", 42)]),
        );

        assert_eq!(found.len(), 1);
        let rec = &found[0];
        assert_eq!(rec.kind, RecommendationKind::UnusedIndex);
        assert_eq!(rec.severity, Severity::Medium);
        assert_eq!(rec.table, "orders");
        assert_eq!(rec.index.as_deref(), Some("idx_orders_status"));
        assert_eq!(rec.action, "Consider dropping index idx_orders_status");
        assert_eq!(
            rec.sql.as_deref(),
            Some("DROP INDEX IF EXISTS public.idx_orders_status")
        );
    }

    #[test]
    fn usage_is_matched_per_table() {
        let indexes = vec![
            IndexInfo::new("orders", "idx_created_at", &["created_at"]),
            IndexInfo::new("events", "idx_created_at", &["created_at"]),
        ];
        let found =
            unused_index_recommendations("public", &indexes, &usage(&[("orders", "idx_created_at", 9)]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].table, "events");
    }

    #[test]
    fn unique_unused_index_mentions_constraint() {
        let indexes = vec![IndexInfo::new("users", "users_email_key", &["email"]).unique()];
        let found = unused_index_recommendations("public", &indexes, &IndexUsage::new());
        assert!(found[0].description.contains("enforces uniqueness"));
    }

    #[test]
    fn missing_fk_statement_is_named_from_table_and_column() {
        let fk = ForeignKeyColumn::new("orders", "customer_id", "customers", "id");
        let rec = missing_fk_recommendation("public", &fk);

        assert_eq!(rec.kind, RecommendationKind::MissingFkIndex);
        assert_eq!(rec.severity, Severity::High);
        assert_eq!(rec.column.as_deref(), Some("customer_id"));
        assert_eq!(
            rec.sql.as_deref(),
            Some("CREATE INDEX idx_orders_customer_id ON public.orders (customer_id)")
        );
        assert_eq!(
            rec.description,
            "Foreign key orders.customer_id references customers.id but has no index"
        );
    }

    #[test]
    fn duplicate_pair_reported_once() {
        let indexes = vec![
            IndexInfo::new("orders", "idx_b", &["customer_id"]),
            IndexInfo::new("orders", "idx_a", &["customer_id"]),
            IndexInfo::new("orders", "idx_c", &["customer_id", "status"]),
        ];
        let found = duplicate_index_recommendations(&indexes);

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].index.as_deref(), Some("idx_a"));
        assert_eq!(found[0].related_index.as_deref(), Some("idx_b"));
        assert_eq!(found[0].severity, Severity::Medium);
        assert!(found[0].description.contains("idx_a and idx_b"));
    }

    #[test]
    fn three_identical_indexes_give_three_pairs() {
        let indexes = vec![
            IndexInfo::new("t", "i1", &["a", "b"]),
            IndexInfo::new("t", "i2", &["a", "b"]),
            IndexInfo::new("t", "i3", &["a", "b"]).with_type("hash"),
        ];
        let pairs: HashSet<_> = duplicate_index_recommendations(&indexes)
            .into_iter()
            .map(|r| (r.index.unwrap_or_default(), r.related_index.unwrap_or_default()))
            .collect();

        assert_eq!(pairs.len(), 3);
        for (a, b) in &pairs {
            assert!(a < b);
            assert!(!pairs.contains(&(b.clone(), a.clone())));
        }
    }

    #[test]
    fn column_order_and_table_matter_for_duplicates() {
        let indexes = vec![
            IndexInfo::new("t", "i1", &["a", "b"]),
            IndexInfo::new("t", "i2", &["b", "a"]),
            IndexInfo::new("u", "i3", &["a", "b"]),
        ];
        assert!(duplicate_index_recommendations(&indexes).is_empty());
    }

    #[test]
    fn serializes_with_type_field() -> anyhow::Result<()> {
        let fk = ForeignKeyColumn::new("orders", "customer_id", "customers", "id");
        let json = serde_json::to_value(missing_fk_recommendation("public", &fk))?;
        assert_eq!(json["type"], "missing_fk_index");
        assert_eq!(json["severity"], "high");
        assert_eq!(json["table"], "orders");
        Ok(())
    }
}
