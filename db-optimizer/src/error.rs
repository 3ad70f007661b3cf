//! Error types for the optimization engine

use std::time::Duration;

use crate::maintenance::MaintenancePhase;

/// Result type for optimizer operations.
///
/// Convenience alias that uses [`OptimizerError`] as the error type.
pub type Result<T> = std::result::Result<T, OptimizerError>;

/// Boxed source error carried by catalog and maintenance failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error type for every engine operation.
///
/// The variants follow the propagation policy of the engine: errors that
/// compromise all subsequent output are returned to the caller, errors confined
/// to one unit of work (one advisory pass, one table rebuild) are built, logged
/// through the event sink and then dropped.
///
/// # Error Categories
///
/// - **Catalog Errors**: a catalog or statistics view could not be read
/// - **Pass Errors**: the missing-FK or duplicate-index pass failed on its own
/// - **Maintenance Errors**: a fatal maintenance phase failed
/// - **Table Errors**: rebuilding one table's indexes failed
/// - **Control Errors**: cancellation or statement timeout
/// - **Configuration Errors**: invalid or unreadable configuration
#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    /// Failure to read index, usage, table statistics or constraint metadata
    #[error("Catalog read failed during {operation}: {source}")]
    CatalogRead {
        operation: &'static str,
        #[source]
        source: BoxError,
    },

    /// Failure confined to one recommendation pass
    #[error("Recommendation pass {pass} failed: {source}")]
    RecommendationPass {
        pass: &'static str,
        #[source]
        source: Box<OptimizerError>,
    },

    /// Failure of a fatal maintenance phase
    #[error("Maintenance phase {phase} failed: {source}")]
    Maintenance {
        phase: MaintenancePhase,
        #[source]
        source: Box<OptimizerError>,
    },

    /// Failure rebuilding the indexes of a single table
    #[error("Rebuilding indexes of table {table} failed: {source}")]
    TableMaintenance {
        table: String,
        #[source]
        source: Box<OptimizerError>,
    },

    /// A maintenance statement could not be executed
    #[error("Statement `{statement}` failed: {source}")]
    Statement {
        statement: String,
        #[source]
        source: BoxError,
    },

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// A single statement exceeded the configured timeout
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Configuration values are out of range
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// Configuration file could not be parsed
    #[error("Configuration parse error: {source}")]
    Config {
        #[from]
        source: toml::de::Error,
    },

    /// Configuration file could not be read
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl OptimizerError {
    /// Wrap any error raised while reading catalog metadata.
    pub fn catalog_read<E>(operation: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::CatalogRead {
            operation,
            source: Box::new(source),
        }
    }

    /// Wrap any error raised while executing a maintenance statement.
    pub fn statement<S, E>(statement: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Statement {
            statement: statement.into(),
            source: Box::new(source),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Whether this error came from caller cancellation rather than the database.
    ///
    /// Cancellation is never downgraded to a logged warning: passes and the
    /// per-table rebuild loop re-raise it so the whole call stops.
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::RecommendationPass { source, .. }
            | Self::Maintenance { source, .. }
            | Self::TableMaintenance { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}
