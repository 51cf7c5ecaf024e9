//! Rollwatch CLI
//!
//! Command-line interface for the Rollwatch rollup and alerting engine.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use rollwatch::config::{DatabaseBackend, LoggingConfig};
use rollwatch::db::{AlertConfigSource, TriggeredAlertRepository};
use rollwatch::models::{AlertConfig, AlertKind, MetricPoint, SeriesKey};
use rollwatch::rollup::now_millis;
use rollwatch::{Config, Engine, Error};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};
use uuid::Uuid;

/// Rollwatch - rollup storage and threshold alerting for APM metrics
#[derive(Parser)]
#[command(name = "rollwatch")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "ROLLWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Use a process-local store instead of PostgreSQL
    #[arg(long, global = true)]
    in_memory: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (for commands that support it)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the rollup, alert and purge loops
    Serve,

    /// Run one compaction pass
    Rollup {
        /// Only buckets ending at or before this time (epoch millis);
        /// defaults to one base interval ago
        #[arg(long)]
        not_before: Option<i64>,
    },

    /// Evaluate all alert configs once
    CheckAlerts {
        /// Window end (epoch millis); defaults to the last base bucket
        #[arg(long)]
        end_time: Option<i64>,
    },

    /// Store points from a JSON file holding an array of points
    Ingest {
        /// Agent scope the points belong to
        #[arg(long, default_value = "")]
        scope: String,

        /// Path to the JSON file
        #[arg(long)]
        file: PathBuf,
    },

    /// Read aggregates of one series
    Query {
        /// Agent scope
        #[arg(long, default_value = "")]
        scope: String,

        /// Gauge name
        #[arg(long, conflicts_with = "transaction_type")]
        gauge: Option<String>,

        /// Transaction type
        #[arg(long, required_unless_present = "gauge")]
        transaction_type: Option<String>,

        /// Transaction name (overall series if omitted)
        #[arg(long, requires = "transaction_type")]
        transaction_name: Option<String>,

        /// Time range ending now (e.g. "15m", "4h")
        #[arg(long, default_value = "1h", value_parser = humantime::parse_duration)]
        last: Duration,

        /// Rollup level (selected from the range if omitted)
        #[arg(long)]
        level: Option<usize>,
    },

    /// List gauges with stored points
    Gauges {
        /// Agent scope
        #[arg(long, default_value = "")]
        scope: String,
    },

    /// Manage alert configs
    Alerts {
        #[command(subcommand)]
        command: AlertsCommands,
    },

    /// Database management
    Db {
        #[command(subcommand)]
        command: DbCommands,
    },
}

#[derive(Subcommand)]
enum AlertsCommands {
    /// List alert configs
    List {
        /// Only configs of this scope
        #[arg(long)]
        scope: Option<String>,
    },

    /// Create an alert config
    Create {
        /// Agent scope
        #[arg(long, default_value = "")]
        scope: String,

        /// transaction or gauge
        #[arg(long)]
        kind: String,

        #[arg(long)]
        transaction_type: Option<String>,

        #[arg(long)]
        percentile: Option<f64>,

        #[arg(long)]
        threshold_millis: Option<u64>,

        #[arg(long)]
        min_transaction_count: Option<u64>,

        #[arg(long)]
        gauge_name: Option<String>,

        #[arg(long)]
        gauge_threshold: Option<f64>,

        /// Evaluation window
        #[arg(long, default_value = "5m", value_parser = humantime::parse_duration)]
        time_period: Duration,

        /// Notification recipients
        #[arg(long = "email")]
        email_addresses: Vec<String>,
    },

    /// Show one alert config
    Show {
        id: Uuid,
    },

    /// Delete an alert config
    Delete {
        /// Config ID to delete
        id: Uuid,
    },

    /// Show alerts currently triggered
    Triggered {
        #[arg(long)]
        scope: Option<String>,
    },
}

#[derive(Subcommand)]
enum DbCommands {
    /// Run database migrations
    Migrate,

    /// Delete points whose retention has passed
    Purge,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let mut config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if cli.in_memory {
        config.database.backend = DatabaseBackend::Memory;
    }

    // Initialize logging
    let _log_guard = init_tracing(&config.logging, cli.verbose);

    if let Err(e) = install_metrics_exporter(&config) {
        eprintln!("Error starting metrics exporter: {e:#}");
        return ExitCode::FAILURE;
    }

    // Execute command
    let result = match cli.command {
        Commands::Serve => run_serve(&config).await,
        Commands::Rollup { not_before } => run_rollup(&config, not_before, cli.format).await,
        Commands::CheckAlerts { end_time } => {
            run_check_alerts(&config, end_time, cli.format).await
        }
        Commands::Ingest { scope, file } => run_ingest(&config, &scope, &file).await,
        Commands::Query {
            scope,
            gauge,
            transaction_type,
            transaction_name,
            last,
            level,
        } => match series_key(gauge, transaction_type, transaction_name) {
            Ok(series_key) => {
                run_query(&config, &scope, &series_key, last, level, cli.format).await
            }
            Err(e) => Err(e),
        },
        Commands::Gauges { scope } => run_gauges(&config, &scope, cli.format).await,
        Commands::Alerts { command } => run_alerts(&config, command, cli.format).await,
        Commands::Db { command } => run_db(&config, command).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    Config::load(path).context("invalid configuration")
}

fn init_tracing(logging: &LoggingConfig, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stdout = if logging.format == "json" {
        fmt::layer().json().boxed()
    } else {
        fmt::layer().pretty().boxed()
    };

    let (file, guard) = match &logging.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "rollwatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout)
        .with(file)
        .init();
    guard
}

fn install_metrics_exporter(config: &Config) -> anyhow::Result<()> {
    if let Some(address) = config.metrics.listen_address {
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(address)
            .install()
            .context("failed to install Prometheus exporter")?;
        info!(%address, "Prometheus exporter listening");
    }
    Ok(())
}

fn series_key(
    gauge: Option<String>,
    transaction_type: Option<String>,
    transaction_name: Option<String>,
) -> anyhow::Result<SeriesKey> {
    match (gauge, transaction_type, transaction_name) {
        (Some(gauge), _, _) => Ok(SeriesKey::gauge(gauge)),
        (None, Some(transaction_type), None) => {
            Ok(SeriesKey::transaction_overall(transaction_type))
        }
        (None, Some(transaction_type), Some(transaction_name)) => {
            Ok(SeriesKey::transaction(transaction_type, transaction_name))
        }
        (None, None, _) => anyhow::bail!("either --gauge or --transaction-type is required"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_serve(config: &Config) -> anyhow::Result<()> {
    let engine = Engine::new(config).await?;
    if engine.database().postgres.is_some() {
        engine.database().migrate().await?;
    }
    engine.start().await?;
    Ok(())
}

async fn run_rollup(
    config: &Config,
    not_before: Option<i64>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let engine = Engine::new(config).await?;
    let summary = match not_before {
        Some(not_before) => engine.store().rollup(not_before).await?,
        None => engine
            .scheduler()
            .run_rollup(now_millis())
            .await?
            .unwrap_or_default(),
    };

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Text => println!(
            "Rolled up {} buckets ({} empty, {} retried, {} failed) across {} scopes, {} failed",
            summary.compaction.buckets_compacted,
            summary.compaction.empty_buckets,
            summary.compaction.retried,
            summary.compaction.failed,
            summary.scopes,
            summary.failed_scopes
        ),
    }
    Ok(())
}

async fn run_check_alerts(
    config: &Config,
    end_time: Option<i64>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let engine = Engine::new(config).await?;
    let summary = match end_time {
        // run_alerts floors to the base interval; an explicit end time is used as is
        Some(end_time) => {
            let evaluator = engine.evaluator();
            rollwatch::scheduler::AlertCycleSummary {
                end_time,
                transaction: evaluator.check_transaction_alerts(end_time).await?,
                gauge: evaluator.check_gauge_alerts(end_time).await?,
            }
        }
        None => engine.scheduler().run_alerts(now_millis()).await?,
    };

    match format {
        OutputFormat::Json => print_json(&summary)?,
        OutputFormat::Text => {
            for (kind, pass) in [("transaction", summary.transaction), ("gauge", summary.gauge)] {
                println!(
                    "{kind}: {} evaluated, {} triggered, {} resolved, {} failed",
                    pass.evaluated, pass.triggered, pass.resolved, pass.failed
                );
            }
        }
    }
    Ok(())
}

async fn run_ingest(config: &Config, scope: &str, file: &Path) -> anyhow::Result<()> {
    let text = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let points: Vec<MetricPoint> = serde_json::from_str(&text)
        .with_context(|| format!("failed to parse points from {}", file.display()))?;

    let engine = Engine::new(config).await?;
    engine.store().store(scope, &points).await?;
    println!("Stored {} points for scope {scope:?}", points.len());
    Ok(())
}

async fn run_query(
    config: &Config,
    scope: &str,
    series_key: &SeriesKey,
    last: Duration,
    level: Option<usize>,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let engine = Engine::new(config).await?;
    let to_time = now_millis();
    let from_time = to_time - i64::try_from(last.as_millis()).context("range too large")?;
    let level = level.unwrap_or_else(|| engine.select_level(from_time, to_time));

    let points = engine
        .store()
        .read_aggregates(scope, series_key, from_time, to_time, level)
        .await?;

    match format {
        OutputFormat::Json => print_json(&points)?,
        OutputFormat::Text => {
            println!("{series_key} at level {level}: {} points", points.len());
            for point in &points {
                let time = chrono::DateTime::from_timestamp_millis(point.capture_time)
                    .map_or_else(|| point.capture_time.to_string(), |t| t.to_rfc3339());
                println!("  {time}  {}", serde_json::to_string(&point.payload)?);
            }
        }
    }
    Ok(())
}

async fn run_gauges(config: &Config, scope: &str, format: OutputFormat) -> anyhow::Result<()> {
    let engine = Engine::new(config).await?;
    let gauge_names = engine.store().gauge_names(scope).await?;
    match format {
        OutputFormat::Json => print_json(&gauge_names)?,
        OutputFormat::Text => {
            for gauge_name in &gauge_names {
                println!("{gauge_name}");
            }
        }
    }
    Ok(())
}

async fn run_alerts(
    config: &Config,
    command: AlertsCommands,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let engine = Engine::new(config).await?;
    let db = engine.database();

    match command {
        AlertsCommands::List { scope } => {
            let configs = match scope {
                Some(scope) => db.alert_configs.alert_configs(&scope).await?,
                None => db.alert_configs.all_alert_configs().await?,
            };
            match format {
                OutputFormat::Json => print_json(&configs)?,
                OutputFormat::Text => {
                    for config in &configs {
                        println!(
                            "{}  {:<11}  scope={:?}  period={}s  version={}",
                            config.id,
                            config.kind.as_str(),
                            config.agent_scope,
                            config.time_period_seconds,
                            &config.version()[..12]
                        );
                    }
                }
            }
        }
        AlertsCommands::Create {
            scope,
            kind,
            transaction_type,
            percentile,
            threshold_millis,
            min_transaction_count,
            gauge_name,
            gauge_threshold,
            time_period,
            email_addresses,
        } => {
            let config = AlertConfig {
                id: Uuid::new_v4(),
                agent_scope: scope,
                kind: kind.parse::<AlertKind>()?,
                transaction_type,
                transaction_percentile: percentile,
                transaction_threshold_millis: threshold_millis,
                min_transaction_count,
                gauge_name,
                gauge_threshold,
                time_period_seconds: time_period.as_secs(),
                email_addresses,
            };
            config.validate()?;
            db.alert_configs.save_alert_config(&config).await?;
            println!("Created alert config {}", config.id);
        }
        AlertsCommands::Show { id } => {
            let config = db
                .alert_configs
                .alert_config(id)
                .await?
                .ok_or_else(|| Error::not_found("alert config", id.to_string()))?;
            print_json(&config)?;
            println!("version: {}", config.version());
        }
        AlertsCommands::Delete { id } => {
            if !db.alert_configs.delete_alert_config(id).await? {
                return Err(Error::not_found("alert config", id.to_string()).into());
            }
            println!("Deleted alert config {id}");
        }
        AlertsCommands::Triggered { scope } => {
            let triggered = db.triggered_alerts.list(scope.as_deref()).await?;
            match format {
                OutputFormat::Json => print_json(&triggered)?,
                OutputFormat::Text => {
                    for alert in &triggered {
                        println!(
                            "{}  scope={:?}  version={}",
                            alert.triggered_at.to_rfc3339(),
                            alert.agent_scope,
                            alert.alert_config_version
                        );
                    }
                }
            }
        }
    }
    Ok(())
}

async fn run_db(config: &Config, command: DbCommands) -> anyhow::Result<()> {
    let engine = Engine::new(config).await?;
    match command {
        DbCommands::Migrate => {
            engine.database().migrate().await?;
            println!("Migrations applied");
        }
        DbCommands::Purge => {
            let purged = engine.store().purge_expired(now_millis()).await?;
            println!("Purged {purged} expired points");
        }
    }
    Ok(())
}
