//! tlcflow CLI: run and inspect the monthly trip-data pipeline.
//!
//! Commands:
//! - `run`: one run for the month containing a date
//! - `catchup`: every due month since the start date without a successful run
//! - `backfill`: every month in a date range, regardless of history
//! - `plan`: task chain, schedule and the next logical dates
//! - `locate`: source URL, object key and table for a month
//! - `history`: recent run records

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tlcflow_core::config::{StorageBackend, WarehouseBackend};
use tlcflow_core::context::object_key;
use tlcflow_core::{
    BigQueryLoader, GcsObjectStore, HttpFetcher, LocalObjectStore, LocalWarehouse, ObjectStore,
    PipelineConfig, RunKind, WarehouseLoader,
};
use tlcflow_runner::{
    trip_data_pipeline, AlertNotifier, LogNotifier, MonthlySchedule, OutboxNotifier,
    PipelineRunner, PipelineServices, RunHistory, RunOutcome, TASK_DOWNLOAD, TASK_END, TASK_LOAD,
    TASK_START,
};

#[derive(Parser)]
#[command(
    name = "tlcflow",
    version,
    about = "tlcflow - monthly NYC TLC trip data from the web to Cloud Storage to BigQuery"
)]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). Overrides RUST_LOG.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once for the month containing DATE.
    Run {
        /// Any date in the target month (YYYY-MM-DD).
        #[arg(long)]
        date: NaiveDate,
    },
    /// Run every due month since the start date that has not succeeded yet.
    Catchup,
    /// Run every month from FROM through TO, ignoring history.
    Backfill {
        /// First month (YYYY-MM-DD, any day of the month).
        #[arg(long)]
        from: NaiveDate,

        /// Last month, inclusive.
        #[arg(long)]
        to: NaiveDate,
    },
    /// Show the task chain, schedule and upcoming logical dates.
    Plan {
        /// Number of upcoming logical dates to list.
        #[arg(long, default_value_t = 3)]
        count: usize,
    },
    /// Print the source URL, object key and table for a month.
    Locate {
        /// Any date in the target month (YYYY-MM-DD).
        #[arg(long)]
        date: NaiveDate,
    },
    /// Show recent runs, newest first.
    History {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Run { date } => run_once(config_path, date),
        Commands::Catchup => run_catchup(config_path),
        Commands::Backfill { from, to } => run_backfill(config_path, from, to),
        Commands::Plan { count } => show_plan(config_path, count),
        Commands::Locate { date } => show_location(config_path, date),
        Commands::History { limit } => show_history(config_path, limit),
    }
}

fn init_tracing(verbose: u8) {
    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Config for commands that touch backends: file + environment, validated.
fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    PipelineConfig::load(path).context("invalid configuration")
}

/// Config for read-only commands: bucket and project may be absent.
fn load_config_unchecked(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    config.apply_env(|key| std::env::var(key).ok());
    Ok(config)
}

fn build_services(config: &PipelineConfig) -> Result<PipelineServices> {
    let fetcher = HttpFetcher::new(Duration::from_secs(config.source.timeout_secs))
        .context("failed to build source fetcher")?;

    let store: Arc<dyn ObjectStore> = match config.storage.backend {
        StorageBackend::Local => Arc::new(LocalObjectStore::new(config.storage.root.clone())),
        StorageBackend::Gcs => {
            let mut gcs = GcsObjectStore::new(
                config.access_token.clone(),
                Duration::from_secs(config.storage.timeout_secs),
            )
            .context("failed to build Cloud Storage client")?;
            if let Some(base) = &config.storage.base_url {
                gcs = gcs.with_base_url(base.clone());
            }
            Arc::new(gcs)
        }
    };

    let warehouse: Arc<dyn WarehouseLoader> = match config.warehouse.backend {
        WarehouseBackend::Local => {
            Arc::new(LocalWarehouse::new(config.warehouse.root.clone(), store.clone()))
        }
        WarehouseBackend::Bigquery => {
            let mut bq = BigQueryLoader::new(
                config.access_token.clone(),
                Duration::from_secs(config.storage.timeout_secs),
            )
            .context("failed to build BigQuery client")?
            .with_location(config.warehouse.location.clone())
            .with_polling(
                Duration::from_secs(config.warehouse.poll_interval_secs),
                config.warehouse.max_polls,
            );
            if let Some(base) = &config.warehouse.base_url {
                bq = bq.with_base_url(base.clone());
            }
            Arc::new(bq)
        }
    };

    let notifier: Arc<dyn AlertNotifier> = match &config.alert.outbox {
        Some(path) => Arc::new(OutboxNotifier::new(path.clone())),
        None => Arc::new(LogNotifier),
    };

    Ok(PipelineServices {
        fetcher: Arc::new(fetcher),
        store,
        warehouse,
        notifier,
    })
}

fn build_runner(path: Option<&Path>) -> Result<PipelineRunner> {
    let config = load_config(path)?;
    let services = build_services(&config)?;
    Ok(trip_data_pipeline(&config, services)?)
}

fn run_once(path: Option<&Path>, date: NaiveDate) -> Result<()> {
    let runner = build_runner(path)?;
    let logical = runner
        .schedule()
        .logical_date_for(date)
        .with_context(|| format!("no fire time in the month of {date}"))?;
    let outcome = runner.run(logical, RunKind::Manual)?;
    report(&[outcome])
}

fn run_catchup(path: Option<&Path>) -> Result<()> {
    let runner = build_runner(path)?;
    let outcomes = runner.catch_up(Utc::now())?;
    if outcomes.is_empty() {
        println!("Nothing to do: every due month has succeeded.");
        return Ok(());
    }
    report(&outcomes)
}

fn run_backfill(path: Option<&Path>, from: NaiveDate, to: NaiveDate) -> Result<()> {
    if from > to {
        bail!("--from ({from}) is after --to ({to})");
    }
    let runner = build_runner(path)?;
    let outcomes = runner.backfill(from, to)?;
    report(&outcomes)
}

/// Print one line per run; exit 1 when any run failed.
fn report(outcomes: &[RunOutcome]) -> Result<()> {
    let mut failed = 0;
    for outcome in outcomes {
        let record = &outcome.record;
        match record.failed_task() {
            None => println!("{}  ok", record.run_id),
            Some(task) => {
                failed += 1;
                println!(
                    "{}  FAILED at {} after {} attempt(s): {}",
                    record.run_id,
                    task.task_id,
                    task.attempts,
                    task.error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    if failed > 0 {
        eprintln!("{failed} of {} run(s) failed", outcomes.len());
        std::process::exit(1);
    }
    Ok(())
}

fn show_plan(path: Option<&Path>, count: usize) -> Result<()> {
    let config = load_config_unchecked(path)?;
    let schedule = MonthlySchedule::parse(&config.pipeline.schedule)?;
    let locator = config.locator()?;

    println!("Pipeline:   {}", config.pipeline.dag_id);
    println!("            {}", config.pipeline.description);
    println!("Tasks:      {TASK_START} -> {TASK_DOWNLOAD} -> {TASK_LOAD} -> {TASK_END}");
    println!("Schedule:   {} (UTC)", schedule.cron());
    println!(
        "Start date: {} (catch-up {})",
        config.pipeline.start_date,
        if config.pipeline.catchup { "on" } else { "off" }
    );
    println!(
        "Retries:    {} x {}s",
        config.retry.retries, config.retry.delay_secs
    );
    println!("Table:      {}", config.table());
    println!();

    let now = Utc::now();
    let due = schedule.due_logical_dates(config.pipeline.start_date, now).len();
    println!("{due} interval(s) due as of {}", now.format("%Y-%m-%d %H:%M"));
    println!("Next {count} logical date(s):");
    for logical in schedule.upcoming(now, count) {
        let location = locator.locate(logical)?;
        println!(
            "  {}  {}  -> {}",
            logical.format("%Y-%m-%d %H:%M"),
            location.url,
            object_key(locator.service(), &location.file_name)
        );
    }
    Ok(())
}

fn show_location(path: Option<&Path>, date: NaiveDate) -> Result<()> {
    let config = load_config_unchecked(path)?;
    let schedule = MonthlySchedule::parse(&config.pipeline.schedule)?;
    let locator = config.locator()?;
    let logical = schedule
        .logical_date_for(date)
        .with_context(|| format!("no fire time in the month of {date}"))?;
    let location = locator.locate(logical)?;
    let bucket = config
        .bucket()
        .unwrap_or_else(|_| "<unset: GCP_GCS_BUCKET>".to_string());

    println!("Logical date: {}", logical.to_rfc3339());
    println!("Source URL:   {}", location.url);
    println!(
        "Object:       {bucket}/{}",
        object_key(locator.service(), &location.file_name)
    );
    println!("Table:        {}", config.table());
    Ok(())
}

fn show_history(path: Option<&Path>, limit: usize) -> Result<()> {
    let config = load_config_unchecked(path)?;
    let history = RunHistory::for_pipeline(&config.runtime.state_dir, &config.pipeline.dag_id);
    let records = history.recent(limit)?;
    if records.is_empty() {
        println!("No runs recorded in {}", history.path().display());
        return Ok(());
    }
    for record in records {
        let state = if record.succeeded() { "success" } else { "failed" };
        let secs = (record.finished_at - record.started_at).num_seconds();
        println!(
            "{}  {:<8} {:>5}s  {}",
            record.logical_date.format("%Y-%m"),
            state,
            secs,
            record.run_id
        );
        if let Some(task) = record.failed_task() {
            println!(
                "          {} ({} attempt(s)): {}",
                task.task_id,
                task.attempts,
                task.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    Ok(())
}
