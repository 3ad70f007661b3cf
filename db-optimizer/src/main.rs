use clap::{Parser, Subcommand};
use db_optimizer::{
    DatabaseOptimizer, OptimizerConfig, PgCatalog, maintenance::needs_rebuild,
};
use serde::Serialize;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Index advice and routine maintenance for a PostgreSQL database.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Connection string of the database to inspect
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Application schema (overrides the configuration file)
    #[arg(short, long)]
    schema: Option<String>,

    /// Timeout for each catalog query or maintenance statement, in seconds
    #[arg(long)]
    statement_timeout: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Recommend index changes
    Indexes {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// List the slowest statements from pg_stat_statements
    SlowQueries {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show per-table write and bloat statistics
    Tables {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Show table and index sizes
    Overview {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Run ANALYZE, VACUUM and REINDEX on bloated tables
    Optimize {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct TableRow<'a> {
    table: &'a str,
    #[serde(flatten)]
    stats: &'a db_optimizer::catalog::TableStats,
    dead_tuple_ratio: Option<f64>,
    needs_rebuild: bool,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => OptimizerConfig::load(path)?,
        None => OptimizerConfig::default(),
    };
    if let Some(schema) = args.schema {
        config.schema = schema;
    }
    if let Some(secs) = args.statement_timeout {
        config = config.with_statement_timeout(Duration::from_secs(secs));
    }
    config.validate()?;

    let catalog = PgCatalog::connect(&args.database_url, &config).await?;
    let optimizer = DatabaseOptimizer::new(catalog, config)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, stopping after the current statement");
            on_interrupt.cancel();
        }
    });

    match args.command {
        Commands::Indexes { format } => {
            let recommendations = optimizer.analyze_indexes(&cancel).await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&recommendations)?);
                }
                OutputFormat::Summary => {
                    println!("Found {} recommendations:", recommendations.len());
                    for rec in &recommendations {
                        println!("  [{}] {}: {}", rec.severity, rec.kind, rec.description);
                        println!("      {}", rec.action);
                        if let Some(sql) = &rec.sql {
                            println!("      {sql}");
                        }
                    }
                }
            }
        }
        Commands::SlowQueries { format } => {
            let queries = optimizer.analyze_slow_queries(&cancel).await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&queries)?);
                }
                OutputFormat::Summary => {
                    println!(
                        "Found {} queries slower than {:.0} ms:",
                        queries.len(),
                        optimizer.config().slow_query_threshold_ms
                    );
                    for q in &queries {
                        let query = q.query.split_whitespace().collect::<Vec<_>>().join(" ");
                        let preview: String = query.chars().take(100).collect();
                        println!(
                            "  {:>10.1} ms  {:>8} calls  {}",
                            q.mean_exec_time_ms, q.calls, preview
                        );
                    }
                }
            }
        }
        Commands::Tables { format } => {
            let stats = optimizer.table_stats(&cancel).await?;
            let threshold = optimizer.config().bloat_ratio_threshold;
            let rows: Vec<TableRow> = stats
                .iter()
                .map(|(table, stats)| TableRow {
                    table,
                    stats,
                    dead_tuple_ratio: stats.dead_tuple_ratio(),
                    needs_rebuild: needs_rebuild(stats, threshold),
                })
                .collect();
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
                OutputFormat::Summary => {
                    println!("{} tables:", rows.len());
                    for row in &rows {
                        let ratio = row
                            .dead_tuple_ratio
                            .map(|r| format!("{:.1}%", r * 100.0))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "  {:<40} live: {:>10}  dead: {:>10}  ratio: {:>7}{}",
                            row.table,
                            row.stats.live_tuples,
                            row.stats.dead_tuples,
                            ratio,
                            if row.needs_rebuild { "  (reindex)" } else { "" }
                        );
                    }
                }
            }
        }
        Commands::Overview { format } => {
            let overview = optimizer.database_overview(&cancel).await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&overview)?);
                }
                OutputFormat::Summary => {
                    println!(
                        "Total size: {} bytes ({} bytes in indexes)",
                        overview.total_bytes, overview.total_index_bytes
                    );
                    if let Some(pool) = &overview.pool {
                        println!(
                            "Connections: {} open ({} in use, {} idle) of {} max",
                            pool.open_connections, pool.in_use, pool.idle, pool.max_connections
                        );
                    }
                    println!("Tables:");
                    for table in &overview.tables {
                        println!(
                            "  {:<40} {:>14} bytes  (indexes: {} bytes)",
                            table.table, table.total_bytes, table.index_bytes
                        );
                    }
                    println!("Indexes:");
                    for index in &overview.indexes {
                        println!(
                            "  {:<40} {:>14} bytes  {:>10} scans  on {}",
                            index.index, index.size_bytes, index.scans, index.table
                        );
                    }
                }
            }
        }
        Commands::Optimize { format } => {
            let report = optimizer.optimize_database(&cancel).await?;
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                OutputFormat::Summary => {
                    println!("Database optimization completed");
                    println!("  Reindexed: {}", report.rebuilt.len());
                    for table in &report.rebuilt {
                        println!("    {table}");
                    }
                    if !report.failed.is_empty() {
                        println!("  Failed: {}", report.failed.len());
                        for failure in &report.failed {
                            println!("    {}: {}", failure.table, failure.error);
                        }
                    }
                    if !report.skipped_no_live_rows.is_empty() {
                        println!(
                            "  Skipped (no live rows): {}",
                            report.skipped_no_live_rows.join(", ")
                        );
                    }
                }
            }
        }
    }

    Ok(())
}
