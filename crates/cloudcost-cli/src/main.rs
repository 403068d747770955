//! Cloudcost CLI - daily cloud cost collection into SQLite

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use chrono::{NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use cloudcost_core::aggregator::{CostAggregator, RunStatus, RunSummary};
use cloudcost_core::collectors::CollectorRegistry;
use cloudcost_core::config::Config;
use cloudcost_core::cost::{parse_date, DateRange, DateRangeResolver, Provider, RangeMode};
use cloudcost_core::storage::{Database, SqliteCostStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "cloudcost")]
#[command(author, version, about = "Collect daily cloud costs from AWS, GCP and Azure", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// SQLite database path (overrides DB_PATH)
    #[arg(long, global = true)]
    database: Option<PathBuf>,

    /// Log level for cloudcost targets (overrides LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Collect costs and upsert them into the database
    Collect(CollectArgs),

    /// Check provider credentials without collecting
    TestConnections {
        /// Comma separated providers
        #[arg(long, default_value = "aws,gcp,azure")]
        providers: String,
    },

    /// Create or migrate the database schema
    InitDb,

    /// Read stored costs
    Report {
        #[command(subcommand)]
        kind: ReportKind,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct CollectArgs {
    /// Comma separated providers
    #[arg(long, default_value = "aws,gcp,azure")]
    providers: String,

    /// Collect the whole backfill window instead of a single day
    #[arg(long)]
    backfill: bool,

    /// Backfill window length in days (overrides BACKFILL_DAYS, implies --backfill)
    #[arg(long)]
    backfill_days: Option<i64>,

    /// First day to collect (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<String>,

    /// Last day to collect (YYYY-MM-DD)
    #[arg(long)]
    end_date: Option<String>,
}

impl CollectArgs {
    fn wants_backfill(&self) -> bool {
        self.backfill || self.backfill_days.is_some()
    }
}

#[derive(Args)]
struct RangeArgs {
    /// First day (YYYY-MM-DD)
    #[arg(long)]
    start_date: Option<String>,

    /// Last day (YYYY-MM-DD), defaults to today
    #[arg(long)]
    end_date: Option<String>,
}

#[derive(Subcommand)]
enum ReportKind {
    /// Daily totals per provider
    Daily(RangeArgs),
    /// Totals per provider and service
    Services(RangeArgs),
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show effective configuration (secrets redacted)
    Show,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(path) = &cli.database {
        config.database.path = Some(path.clone());
    }

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.app.log_level.clone());
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("cloudcost={level}").parse()?),
        )
        .init();

    match cli.command {
        Commands::Collect(args) => cmd_collect(&config, args, cli.format, cli.quiet).await,
        Commands::TestConnections { providers } => {
            cmd_test_connections(&config, &providers, cli.format, cli.quiet).await
        }
        Commands::InitDb => cmd_init_db(&config, cli.format, cli.quiet).await,
        Commands::Report { kind } => cmd_report(&config, kind, cli.format).await,
        Commands::Config { action } => cmd_config(&config, action, cli.format),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

async fn cmd_collect(
    config: &Config,
    args: CollectArgs,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    let providers = Provider::parse_list(&args.providers)?;
    let start = parse_opt_date(args.start_date.as_deref())?;
    let end = parse_opt_date(args.end_date.as_deref())?;

    let backfill_days = args.backfill_days.unwrap_or(config.app.backfill_days);
    let mode = RangeMode::select(args.wants_backfill(), start, end);
    let range = DateRangeResolver::new(config.app.lookback_days, backfill_days)
        .resolve(mode, start, end)?;

    ensure_credentials(config, &providers)?;

    let db = Database::open(config.database_path()).await?;
    let store = Arc::new(SqliteCostStore::from_database(&db));
    let registry = CollectorRegistry::from_config(config).await?;
    let aggregator = CostAggregator::new(registry, store).with_timeout(config.collector_timeout());

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling in-flight collectors");
            on_interrupt.cancel();
        }
    });

    info!(mode = ?mode, range = %range, "Resolved collection range");
    let summary = aggregator.run_with_cancel(&providers, range, cancel).await?;
    db.close().await;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "status": summary.status(),
                "summary": summary,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text if !quiet => print_summary(&summary),
        OutputFormat::Text => {}
    }

    Ok(match summary.status() {
        RunStatus::Failed => ExitCode::FAILURE,
        RunStatus::Success | RunStatus::PartialSuccess => ExitCode::SUCCESS,
    })
}

async fn cmd_test_connections(
    config: &Config,
    providers: &str,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<ExitCode> {
    let providers = Provider::parse_list(providers)?;
    let configured: BTreeSet<Provider> = providers
        .iter()
        .copied()
        .filter(|p| config.is_configured(*p))
        .collect();

    let mut results = Vec::new();
    for provider in providers.difference(&configured) {
        let reason = config
            .validate_for(&BTreeSet::from([*provider]))
            .join("; ");
        results.push((*provider, Err(format!("not configured: {reason}"))));
    }

    if !configured.is_empty() {
        let registry = CollectorRegistry::from_config(config).await?;
        let checks = registry
            .test_connections(&configured, config.collector_timeout())
            .await?;
        for (provider, result) in checks {
            results.push((provider, result.map_err(|e| e.kind.to_string())));
        }
    }
    results.sort_by_key(|(provider, _)| *provider);

    let all_ok = results.iter().all(|(_, r)| r.is_ok());

    match format {
        OutputFormat::Json => {
            let output: serde_json::Map<String, serde_json::Value> = results
                .iter()
                .map(|(provider, result)| {
                    let value = match result {
                        Ok(()) => serde_json::json!({ "ok": true }),
                        Err(e) => serde_json::json!({ "ok": false, "error": e }),
                    };
                    (provider.to_string(), value)
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text if !quiet => {
            println!("Connection tests:");
            for (provider, result) in &results {
                match result {
                    Ok(()) => println!("  [OK] {provider}"),
                    Err(e) => println!("  [!!] {provider}: {e}"),
                }
            }
        }
        OutputFormat::Text => {}
    }

    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn cmd_init_db(config: &Config, format: OutputFormat, quiet: bool) -> anyhow::Result<ExitCode> {
    let path = config.database_path();
    let db = Database::open(path.clone()).await?;
    db.health_check().await?;
    let status = db.migration_status().await?;
    db.close().await;

    match format {
        OutputFormat::Json => {
            let output = serde_json::json!({
                "path": path.display().to_string(),
                "schema_version": status.current_version,
                "target_version": status.target_version,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text if !quiet => {
            println!("Database ready: {}", path.display());
            println!("  Schema version: {}", status.current_version);
        }
        OutputFormat::Text => {}
    }
    Ok(ExitCode::SUCCESS)
}

async fn cmd_report(config: &Config, kind: ReportKind, format: OutputFormat) -> anyhow::Result<ExitCode> {
    let db = Database::open(config.database_path()).await?;
    let store = SqliteCostStore::from_database(&db);

    match kind {
        ReportKind::Daily(args) => {
            let range = report_range(&args)?;
            let rows = store.daily_totals(range.as_ref()).await?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No costs recorded.");
            } else {
                println!("{:<12} {:<8} {:>8} {:>14}", "DATE", "PROVIDER", "SERVICES", "COST (USD)");
                for row in &rows {
                    println!(
                        "{:<12} {:<8} {:>8} {:>14.4}",
                        row.date.to_string(),
                        row.provider.to_string(),
                        row.service_count,
                        row.total_cost
                    );
                }
            }
        }
        ReportKind::Services(args) => {
            let range = report_range(&args)?;
            let rows = store.service_totals(range.as_ref()).await?;
            if format == OutputFormat::Json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else if rows.is_empty() {
                println!("No costs recorded.");
            } else {
                println!(
                    "{:<8} {:<40} {:>5} {:<12} {:<12} {:>14}",
                    "PROVIDER", "SERVICE", "DAYS", "FIRST", "LAST", "COST (USD)"
                );
                for row in &rows {
                    println!(
                        "{:<8} {:<40} {:>5} {:<12} {:<12} {:>14.4}",
                        row.provider.to_string(),
                        row.service,
                        row.day_count,
                        row.first_date.to_string(),
                        row.last_date.to_string(),
                        row.total_cost
                    );
                }
            }
        }
    }

    db.close().await;
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(config: &Config, action: ConfigAction, format: OutputFormat) -> anyhow::Result<ExitCode> {
    match action {
        ConfigAction::Show => {
            let items = config.list();
            if format == OutputFormat::Json {
                let output: serde_json::Map<String, serde_json::Value> = items
                    .into_iter()
                    .map(|(k, v)| (k, serde_json::Value::String(v)))
                    .collect();
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                for (key, value) in items {
                    println!("{} = {}", key, value);
                }
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helpers
// ============================================================================

fn parse_opt_date(value: Option<&str>) -> anyhow::Result<Option<NaiveDate>> {
    Ok(value.map(parse_date).transpose()?)
}

/// Fail before any I/O when a requested provider lacks credentials
fn ensure_credentials(config: &Config, providers: &BTreeSet<Provider>) -> anyhow::Result<()> {
    let errors = config.validate_for(providers);
    if errors.is_empty() {
        return Ok(());
    }

    let details: Vec<String> = errors.iter().map(|e| format!("  - {e}")).collect();
    Err(anyhow!(
        "Missing credentials for the requested providers:\n{}",
        details.join("\n")
    ))
}

/// Report window; `--end-date` alone is rejected, `--start-date` alone runs to today
fn report_range(args: &RangeArgs) -> anyhow::Result<Option<DateRange>> {
    let start = parse_opt_date(args.start_date.as_deref())?;
    let end = parse_opt_date(args.end_date.as_deref())?;

    match (start, end) {
        (None, None) => Ok(None),
        (Some(start), end) => {
            let end = end.unwrap_or_else(|| Utc::now().date_naive());
            Ok(Some(DateRange::new(start, end)?))
        }
        (None, Some(_)) => bail!("--end-date requires --start-date"),
    }
}

fn print_summary(summary: &RunSummary) {
    for line in summary_lines(summary) {
        println!("{line}");
    }
}

/// Per-provider stats describe what was collected; they are only "written" when the batch landed
fn summary_lines(summary: &RunSummary) -> Vec<String> {
    let persisted = summary.write_error.is_none();
    let mut lines = vec![format!(
        "Collection run {} ({})",
        summary.run_id, summary.requested_range
    )];

    for provider in &summary.providers_requested {
        if let Some(err) = summary.failed.get(provider) {
            lines.push(format!("  [!!] {provider}: {}", err.kind));
            continue;
        }
        let stats = summary.stats.get(provider).cloned().unwrap_or_default();
        if persisted {
            lines.push(format!(
                "  [OK] {provider}: {} records, ${:.4}",
                stats.records, stats.total_cost
            ));
        } else {
            lines.push(format!(
                "  [--] {provider}: {} records collected, ${:.4} (not saved)",
                stats.records, stats.total_cost
            ));
        }
    }

    if let Some(err) = &summary.write_error {
        lines.push(format!("  Write failed: {err}"));
    }
    lines.push(format!("  Records written: {}", summary.records_written));
    if persisted {
        lines.push(format!("  Total: ${:.4}", summary.total_cost()));
    }
    lines.push(format!("  Status: {}", summary.status()));
    lines
}
