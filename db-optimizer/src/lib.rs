//! db-optimizer: Index advice and routine maintenance for PostgreSQL
//!
//! This crate inspects a database's system catalogs and statistics views,
//! recommends index changes, surfaces slow statements, and runs an ordered
//! maintenance pass (`ANALYZE`, `VACUUM`, selective `REINDEX`).
//!
//! ## Key Modules
//!
//! - **[`catalog`]**: Read-only catalog access and the maintenance executor, with
//!   a PostgreSQL implementation and an in-memory one for tests
//! - **[`recommend`]**: Unused, missing foreign-key and duplicate index heuristics
//! - **[`slow_query`]**: Slow statement filtering and ranking
//! - **[`maintenance`]**: The phase-ordered maintenance state machine
//! - **[`optimizer`]**: The [`DatabaseOptimizer`] facade tying it together
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use db_optimizer::{DatabaseOptimizer, OptimizerConfig, PgCatalog};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = OptimizerConfig::new("public");
//! let catalog = PgCatalog::connect("postgres://localhost/app", &config).await?;
//! let optimizer = DatabaseOptimizer::new(catalog, config)?;
//!
//! let cancel = CancellationToken::new();
//! for rec in optimizer.analyze_indexes(&cancel).await? {
//!     println!("[{}] {}", rec.severity, rec.description);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! pg_catalog / pg_stat_* ─► CatalogReader ─► IndexAdvisor ──────────► recommendations
//!                                        ├─► SlowQueryAnalyzer ─────► slow queries
//!                                        └─► MaintenanceOrchestrator ─► MaintenanceExecutor
//!                                                  │
//!                                                  └─► EventSink (warnings, progress)
//! ```

pub mod catalog;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod maintenance;
pub mod optimizer;
pub mod recommend;
pub mod slow_query;

pub use catalog::{CatalogReader, MaintenanceExecutor, MemoryCatalog, PgCatalog, PoolStatus};
pub use config::OptimizerConfig;
pub use error::{OptimizerError, Result};
pub use events::{Event, EventLevel, EventSink, RecordingSink, TracingSink};
pub use maintenance::{MaintenancePhase, MaintenanceReport};
pub use optimizer::{DatabaseOptimizer, DatabaseOverview};
pub use recommend::{IndexRecommendation, RecommendationKind, Severity};
