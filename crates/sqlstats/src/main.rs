//! sqlstats - keeps persisted SQL execution statistics bounded
//!
//! Every invocation acts as a node: it opens the shared database and makes
//! sure the `sql-stats-compaction` schedule exists before running the
//! requested command.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result};
use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sqlstats_core::config::Config;
use sqlstats_core::jobs::{self, JobRegistry, ScheduledJob, SchedulerClock, SystemClock};
use sqlstats_core::logging::init_logging;
use sqlstats_core::persisted_stats;
use sqlstats_core::settings::{ClusterSettings, SettingValue};
use sqlstats_core::sqlstats::CompactionScheduleOrchestrator;
use sqlstats_core::storage::Database;
use tracing::info;

/// Exit code for `sqlstats check` when the schedule is unhealthy.
const EXIT_ANOMALY: u8 = 2;

#[derive(Parser)]
#[command(
    name = "sqlstats",
    author,
    version,
    about = "Scheduled compaction of persisted SQL execution statistics"
)]
struct Cli {
    /// Path to sqlstats.toml (defaults are used when omitted)
    #[arg(long, global = true, env = "SQLSTATS_CONFIG")]
    config: Option<PathBuf>,

    /// Database path (overrides [storage].db_path)
    #[arg(long, global = true, env = "SQLSTATS_DB")]
    db: Option<PathBuf>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Plain)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Plain,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and ensure the compaction schedule exists
    Init,

    /// Run the node until Ctrl-C: scheduler, settings watcher, health reporter
    Serve,

    /// Run one compaction immediately
    Compact,

    /// Check the compaction schedule for anomalies (exit 2 when unhealthy)
    Check,

    /// Schedule administration
    Schedule {
        #[command(subcommand)]
        command: ScheduleCommand,
    },

    /// Cluster settings administration
    Settings {
        #[command(subcommand)]
        command: SettingsCommand,
    },

    /// Persisted statistics utilities
    Stats {
        #[command(subcommand)]
        command: StatsCommand,
    },
}

#[derive(Subcommand)]
enum ScheduleCommand {
    /// Show a schedule
    Show(ScheduleTarget),
    /// Pause a schedule
    Pause(ScheduleTarget),
    /// Resume a paused schedule
    Resume(ScheduleTarget),
    /// Drop a schedule
    Drop(ScheduleTarget),
}

#[derive(Args)]
struct ScheduleTarget {
    /// Schedule id (defaults to the sql-stats-compaction schedule)
    #[arg(long)]
    id: Option<i64>,
}

#[derive(Subcommand)]
enum SettingsCommand {
    /// List every cluster setting
    List,
    /// Show one setting
    Get { name: String },
    /// Set a setting
    Set {
        name: String,
        #[arg(allow_hyphen_values = true)]
        value: String,
    },
    /// Reset a setting to its default
    Reset { name: String },
}

#[derive(Subcommand)]
enum StatsCommand {
    /// Insert synthetic statement and transaction statistics
    Seed {
        /// Number of hourly aggregation buckets, ending at the current hour
        #[arg(long, default_value_t = 24)]
        buckets: u32,
        /// Fingerprints per bucket
        #[arg(long, default_value_t = 10)]
        fingerprints: u32,
    },
}

/// A node wired against the shared database.
struct Node {
    config: Config,
    db: Database,
    orchestrator: CompactionScheduleOrchestrator,
    registry: JobRegistry,
}

impl Node {
    async fn start(config: Config) -> Result<Self> {
        let db = Database::from_config(&config.storage);
        db.initialize().with_context(|| {
            format!("failed to initialize database at {}", db.path().display())
        })?;
        let clock: Arc<dyn SchedulerClock> = Arc::new(SystemClock);
        let settings = ClusterSettings::new(db.clone());
        let orchestrator =
            CompactionScheduleOrchestrator::new(db.clone(), settings, Arc::clone(&clock));
        let mut registry = JobRegistry::from_config(db.clone(), &config.scheduler).with_clock(clock);
        orchestrator
            .start(&mut registry)
            .await
            .context("failed to ensure the compaction schedule")?;
        Ok(Self {
            config,
            db,
            orchestrator,
            registry,
        })
    }

    async fn resolve(&self, target: &ScheduleTarget) -> Result<i64> {
        match target.id {
            Some(id) => Ok(id),
            None => Ok(self.orchestrator.lifecycle().load_schedule().await?.id),
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(db) = &cli.db {
        config.storage.db_path = db.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<sqlstats_core::Error>()
                .and_then(sqlstats_core::Error::remediation)
            {
                eprint!("{}", remediation.render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(&cli)?;
    init_logging(&config.log_config()).context("failed to initialize logging")?;
    let format = cli.format;
    let node = Node::start(config).await?;

    match cli.command {
        Commands::Init => {
            let schedule = node.orchestrator.lifecycle().load_schedule().await?;
            emit(format, &schedule, || {
                format!(
                    "Initialized {}\n{}",
                    node.db.path().display(),
                    render_schedule(&schedule)
                )
            })?;
        }
        Commands::Serve => serve(node).await?,
        Commands::Compact => {
            let summary = node
                .orchestrator
                .compact_now(Arc::new(AtomicBool::new(false)))
                .await
                .context("compaction failed")?;
            emit(format, &summary, || format!("Compacted: {summary}\n"))?;
        }
        Commands::Check => {
            let report = node.orchestrator.check_health().await?;
            emit(format, &report, || match &report.detail {
                None => format!(
                    "OK: schedule {} ({}) is healthy\n",
                    report.schedule.id, report.schedule.recurrence
                ),
                Some(detail) => format!("ANOMALY: {detail}\n"),
            })?;
            if let Some(anomaly) = &report.anomaly {
                if format == OutputFormat::Plain {
                    eprint!("{}", anomaly.remediation().render_plain());
                }
                return Ok(ExitCode::from(EXIT_ANOMALY));
            }
        }
        Commands::Schedule { command } => schedule_command(&node, command, format).await?,
        Commands::Settings { command } => settings_command(&node, command, format).await?,
        Commands::Stats { command } => match command {
            StatsCommand::Seed {
                buckets,
                fingerprints,
            } => {
                let now = Utc::now();
                let latest = now.duration_trunc(TimeDelta::hours(1)).unwrap_or(now);
                let summary = node
                    .db
                    .call(move |conn| {
                        persisted_stats::seed_synthetic(conn, latest, buckets, fingerprints)
                    })
                    .await?;
                emit(format, &summary, || {
                    format!(
                        "Seeded {} statement rows and {} transaction rows\n",
                        summary.statement_rows, summary.transaction_rows
                    )
                })?;
            }
        },
    }
    Ok(ExitCode::SUCCESS)
}

async fn serve(node: Node) -> Result<()> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let background = node
        .orchestrator
        .spawn_background(&node.config.health, Arc::clone(&shutdown))
        .await
        .context("failed to start background tasks")?;
    let registry = Arc::new(node.registry.with_cancel_flag(Arc::clone(&shutdown)));
    let scheduler = Arc::clone(&registry)
        .spawn_scheduler_loop(node.config.scheduler.poll_interval(), Arc::clone(&shutdown));

    info!(
        node_id = %registry.node_id(),
        db = %node.db.path().display(),
        "sqlstats node running; press Ctrl-C to stop"
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;

    info!("Shutdown requested");
    background.signal_shutdown();
    let _ = scheduler.await;
    // Health checks can be minutes apart; do not wait for their next tick.
    background.abort();
    background.join().await;
    Ok(())
}

async fn schedule_command(node: &Node, command: ScheduleCommand, format: OutputFormat) -> Result<()> {
    match command {
        ScheduleCommand::Show(target) => {
            let id = node.resolve(&target).await?;
            let schedule = node.db.call(move |conn| jobs::load_schedule(conn, id)).await?;
            emit(format, &schedule, || render_schedule(&schedule))?;
        }
        ScheduleCommand::Pause(target) => {
            let id = node.resolve(&target).await?;
            let schedule = node
                .db
                .call(move |conn| jobs::pause_schedule(conn, id))
                .await?;
            info!(schedule_id = id, "Schedule paused");
            emit(format, &schedule, || {
                format!("Paused schedule {id}\n{}", render_schedule(&schedule))
            })?;
        }
        ScheduleCommand::Resume(target) => {
            let id = node.resolve(&target).await?;
            let now = node.registry.clock().now();
            let schedule = node
                .db
                .call(move |conn| jobs::resume_schedule(conn, id, now))
                .await?;
            info!(schedule_id = id, "Schedule resumed");
            emit(format, &schedule, || {
                format!("Resumed schedule {id}\n{}", render_schedule(&schedule))
            })?;
        }
        ScheduleCommand::Drop(target) => {
            let id = node.resolve(&target).await?;
            node.registry.drop_schedule(id).await?;
            emit(format, &serde_json::json!({ "dropped": id }), || {
                format!("Dropped schedule {id}\n")
            })?;
        }
    }
    Ok(())
}

async fn settings_command(node: &Node, command: SettingsCommand, format: OutputFormat) -> Result<()> {
    let orchestrator = &node.orchestrator;
    match command {
        SettingsCommand::List => {
            let settings = orchestrator.settings().list().await?;
            emit(format, &settings, || {
                settings.iter().map(render_setting).collect::<String>()
            })?;
        }
        SettingsCommand::Get { name } => {
            let setting = orchestrator.settings().get(&name).await?;
            emit(format, &setting, || render_setting(&setting))?;
        }
        SettingsCommand::Set { name, value } => {
            let setting = orchestrator.set_setting(&name, &value).await?;
            emit(format, &setting, || render_setting(&setting))?;
        }
        SettingsCommand::Reset { name } => {
            let setting = orchestrator.reset_setting(&name).await?;
            emit(format, &setting, || render_setting(&setting))?;
        }
    }
    Ok(())
}

fn emit<T: Serialize>(format: OutputFormat, value: &T, plain: impl FnOnce() -> String) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Plain => print!("{}", plain()),
    }
    Ok(())
}

fn render_ts(ts: Option<DateTime<Utc>>) -> String {
    ts.map_or_else(|| "-".to_string(), |ts| ts.to_rfc3339())
}

fn render_schedule(schedule: &ScheduledJob) -> String {
    format!(
        "Schedule {}: {}\n  executor:   {}\n  owner:      {}\n  recurrence: {}\n  status:     {}\n  next run:   {}\n  last run:   {}\n  message:    {}\n",
        schedule.id,
        schedule.name,
        schedule.executor_type,
        schedule.owner,
        schedule.recurrence,
        schedule.status,
        render_ts(schedule.next_run),
        render_ts(schedule.last_run),
        schedule.status_message.as_deref().unwrap_or("-"),
    )
}

fn render_setting(setting: &SettingValue) -> String {
    let marker = if setting.is_default { "" } else { " (modified)" };
    format!(
        "{} = {}{}\n  {} (default: {})\n",
        setting.name, setting.value, marker, setting.description, setting.default
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "sqlstats",
            "settings",
            "set",
            "sql.stats.persisted_rows.max",
            "10",
            "--db",
            "/tmp/x.db",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(
            cli.command,
            Commands::Settings {
                command: SettingsCommand::Set { .. }
            }
        ));
    }

    #[test]
    fn schedule_target_defaults_to_compaction_schedule() {
        let cli = Cli::try_parse_from(["sqlstats", "schedule", "drop"]).unwrap();
        match cli.command {
            Commands::Schedule {
                command: ScheduleCommand::Drop(target),
            } => assert_eq!(target.id, None),
            _ => panic!("expected schedule drop"),
        }
    }
}
