//! Configuration for the optimization engine.
//!
//! Every threshold the heuristics use lives here with the engine's default
//! policy values. A configuration can be built in code with the `with_*`
//! methods or loaded from a TOML file:
//!
//! ```toml
//! schema = "public"
//! slow_query_threshold_ms = 1000.0
//! slow_query_limit = 20
//! bloat_ratio_threshold = 0.2
//! statement_timeout_secs = 300
//! excluded_table_prefixes = ["pg_"]
//! ```

use crate::error::{OptimizerError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Mean execution time above which a query counts as slow
pub const DEFAULT_SLOW_QUERY_THRESHOLD_MS: f64 = 1000.0;
/// Maximum number of slow queries surfaced per call
pub const DEFAULT_SLOW_QUERY_LIMIT: usize = 20;
/// Dead/live tuple ratio above which a table's indexes are rebuilt
pub const DEFAULT_BLOAT_RATIO_THRESHOLD: f64 = 0.2;
pub const DEFAULT_SCHEMA: &str = "public";

/// Configuration for [`DatabaseOptimizer`](crate::optimizer::DatabaseOptimizer)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    /// Application schema every catalog query is scoped to
    pub schema: String,
    /// Slow query threshold on mean execution time, in milliseconds
    pub slow_query_threshold_ms: f64,
    /// Cap on the number of slow queries returned
    pub slow_query_limit: usize,
    /// Strict lower bound on dead/live tuples for a rebuild
    pub bloat_ratio_threshold: f64,
    /// Timeout for each individual catalog query or maintenance statement
    pub statement_timeout_secs: Option<u64>,
    /// Tables whose name starts with one of these prefixes are internal
    pub excluded_table_prefixes: Vec<String>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            slow_query_threshold_ms: DEFAULT_SLOW_QUERY_THRESHOLD_MS,
            slow_query_limit: DEFAULT_SLOW_QUERY_LIMIT,
            bloat_ratio_threshold: DEFAULT_BLOAT_RATIO_THRESHOLD,
            statement_timeout_secs: None,
            excluded_table_prefixes: vec!["pg_".to_string()],
        }
    }
}

impl OptimizerConfig {
    /// Create a configuration with the default policy for `schema`.
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&source)
    }

    pub fn with_slow_query_threshold_ms(mut self, threshold_ms: f64) -> Self {
        self.slow_query_threshold_ms = threshold_ms;
        self
    }

    pub fn with_slow_query_limit(mut self, limit: usize) -> Self {
        self.slow_query_limit = limit;
        self
    }

    pub fn with_bloat_ratio_threshold(mut self, ratio: f64) -> Self {
        self.bloat_ratio_threshold = ratio;
        self
    }

    /// Bound every catalog query and maintenance statement by `timeout`.
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout_secs = Some(timeout.as_secs().max(1));
        self
    }

    pub fn with_excluded_table_prefixes(mut self, prefixes: Vec<String>) -> Self {
        self.excluded_table_prefixes = prefixes;
        self
    }

    pub fn statement_timeout(&self) -> Option<Duration> {
        self.statement_timeout_secs.map(Duration::from_secs)
    }

    pub fn slow_query_threshold(&self) -> Duration {
        Duration::try_from_secs_f64(self.slow_query_threshold_ms / 1000.0).unwrap_or_default()
    }

    /// Whether `table` is an internal table excluded by name convention
    pub fn is_excluded_table(&self, table: &str) -> bool {
        self.excluded_table_prefixes
            .iter()
            .any(|prefix| table.starts_with(prefix.as_str()))
    }

    /// Reject values the heuristics cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.schema.trim().is_empty() {
            return Err(OptimizerError::invalid_config("schema must not be empty"));
        }
        if !self.slow_query_threshold_ms.is_finite() || self.slow_query_threshold_ms < 0.0 {
            return Err(OptimizerError::invalid_config(format!(
                "slow_query_threshold_ms must be a non-negative number, got {}",
                self.slow_query_threshold_ms
            )));
        }
        if self.slow_query_limit == 0 {
            return Err(OptimizerError::invalid_config(
                "slow_query_limit must be at least 1",
            ));
        }
        if !self.bloat_ratio_threshold.is_finite() || self.bloat_ratio_threshold < 0.0 {
            return Err(OptimizerError::invalid_config(format!(
                "bloat_ratio_threshold must be a non-negative number, got {}",
                self.bloat_ratio_threshold
            )));
        }
        if self.statement_timeout_secs == Some(0) {
            return Err(OptimizerError::invalid_config(
                "statement_timeout_secs must be at least 1 when set",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_engine_policy() {
        let config = OptimizerConfig::default();
        assert_eq!(config.schema, "public");
        assert_eq!(config.slow_query_threshold(), Duration::from_secs(1));
        assert_eq!(config.slow_query_limit, 20);
        assert_eq!(config.bloat_ratio_threshold, 0.2);
        assert_eq!(config.statement_timeout(), None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() -> anyhow::Result<()> {
        let config = OptimizerConfig::from_toml_str(
            r#"
            schema = "app"
            statement_timeout_secs = 30
            "#,
        )?;
        assert_eq!(config.schema, "app");
        assert_eq!(config.statement_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.slow_query_limit, DEFAULT_SLOW_QUERY_LIMIT);
        Ok(())
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = OptimizerConfig::from_toml_str("slow_query_treshold_ms = 5").unwrap_err();
        assert!(matches!(err, OptimizerError::Config { .. }));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = OptimizerConfig::from_toml_str("slow_query_limit = 0").unwrap_err();
        assert!(matches!(err, OptimizerError::InvalidConfig { .. }));

        let err = OptimizerConfig::new("  ").validate().unwrap_err();
        assert!(err.to_string().contains("schema"));

        let err = OptimizerConfig::default()
            .with_bloat_ratio_threshold(f64::NAN)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("bloat_ratio_threshold"));
    }

    #[test]
    fn load_reads_file() -> anyhow::Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "bloat_ratio_threshold = 0.5")?;
        writeln!(file, "excluded_table_prefixes = [\"pg_\", \"_sqlx\"]")?;

        let config = OptimizerConfig::load(file.path())?;
        assert_eq!(config.bloat_ratio_threshold, 0.5);
        assert!(config.is_excluded_table("_sqlx_migrations"));
        assert!(config.is_excluded_table("pg_stat"));
        assert!(!config.is_excluded_table("orders"));
        Ok(())
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = OptimizerConfig::load("/nonexistent/db-optimizer.toml").unwrap_err();
        assert!(matches!(err, OptimizerError::Io { .. }));
    }
}
