//! turbine_service: daily batch job.
//!
//! Ingests turbine CSV exports, computes statistics, cleans pending readings
//! and refreshes daily summaries. Intended to be invoked by a scheduler once
//! a day; overlapping invocations are safe.
//!
//! Exit status: 0 success, 2 when any item failed (see the run report),
//! 1 when configuration or the database connection failed.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};

use turbine_service::archive::{ArchiveMover, ConsumedSourceHook, NoopHook};
use turbine_service::config::PipelineConfig;
use turbine_service::ingest::consistency::{SourceLag, lagging_sources};
use turbine_service::logging::init_logger;
use turbine_service::model::{IngestionCursor, StatSnapshot};
use turbine_service::pipeline;
use turbine_service::report::{EXIT_FATAL, EXIT_SUCCESS, RunReport, print_summary};
use turbine_service::sources::all_source_ids;
use turbine_service::store::pg::REQUIRED_SCHEMAS;
use turbine_service::store::{MemoryStore, PgStore, Store};

#[derive(Parser)]
#[command(name = "turbine_service")]
#[command(about = "Wind turbine CSV ingestion, cleaning and daily summaries", long_about = None)]
struct Cli {
    /// Path to a TOML config file (otherwise TURBINE_CONFIG, then
    /// ./turbine_service.toml, then defaults).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `info` or `turbine_service=debug`. RUST_LOG wins.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Use an in-memory store; nothing is persisted or archived.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Print a human-readable summary instead of the JSON report.
    #[arg(long, global = true)]
    text: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Ingest, compute statistics, clean and summarize (default)
    Run,
    /// Recompute daily summaries from stored clean and anomalous readings
    Summarize {
        /// Only this UTC day (YYYY-MM-DD)
        #[arg(long)]
        day: Option<NaiveDate>,
    },
    /// Show ingestion cursors and sources lagging behind the newest one
    Cursors,
    /// Show the most recent statistics snapshot
    Stats,
}

#[derive(Serialize)]
struct CursorListing {
    cursors: Vec<IngestionCursor>,
    lagging: Vec<SourceLag>,
    /// Declared sources without a cursor yet.
    never_ingested: Vec<String>,
}

fn main() -> ExitCode {
    match try_main() {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("turbine_service: {:#}", e);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn try_main() -> Result<u8> {
    let cli = Cli::parse();

    let loaded = PipelineConfig::load(cli.config.as_deref()).context("loading configuration")?;
    let level = cli.log_level.as_deref().unwrap_or(&loaded.config.log_level);
    init_logger(level, loaded.config.log_file.as_deref()).context("opening log file")?;
    loaded.log_origin();
    let config = loaded.config;

    let mut store = open_store(&config, cli.dry_run)?;
    let hook: Box<dyn ConsumedSourceHook> = match (&config.archive_dir, cli.dry_run) {
        (Some(dir), false) => Box::new(ArchiveMover::new(dir.clone())),
        _ => Box::new(NoopHook),
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            info!(source_dir = %config.source_dir.display(), dry_run = cli.dry_run, "starting pipeline run");
            let mut report = pipeline::run(&mut *store, &config, &*hook, Utc::now());
            report.dry_run = cli.dry_run;
            emit(&report, cli.text)
        }
        Command::Summarize { day } => {
            info!(day = ?day, "recomputing daily summaries");
            let mut report = pipeline::resummarize(&mut *store, day, Utc::now());
            report.dry_run = cli.dry_run;
            emit(&report, cli.text)
        }
        Command::Cursors => {
            let cursors = store.load_cursors().context("loading cursors")?;
            let lagging = lagging_sources(&cursors, config.max_source_lag());
            let never_ingested = all_source_ids(&config.sources)
                .into_iter()
                .filter(|id| !cursors.iter().any(|c| c.source_id == *id))
                .map(String::from)
                .collect();
            let listing = CursorListing {
                cursors,
                lagging,
                never_ingested,
            };
            println!("{}", serde_json::to_string_pretty(&listing)?);
            Ok(EXIT_SUCCESS)
        }
        Command::Stats => {
            let snapshots: Vec<StatSnapshot> =
                store.latest_snapshots().context("loading statistics snapshots")?;
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
            Ok(EXIT_SUCCESS)
        }
    }
}

fn open_store(config: &PipelineConfig, dry_run: bool) -> Result<Box<dyn Store>> {
    if dry_run {
        info!("dry run: using in-memory store");
        return Ok(Box::new(MemoryStore::new()));
    }
    let url = config.database_url()?;
    let store = PgStore::connect_and_verify(&url, &REQUIRED_SCHEMAS)
        .context("connecting to PostgreSQL")?;
    Ok(Box::new(store))
}

fn emit(report: &RunReport, text: bool) -> Result<u8> {
    info!(
        errors = report.error_count(),
        exit_code = report.exit_code(),
        "run finished"
    );
    if text {
        print_summary(report);
    } else {
        println!("{}", report.to_json().context("serializing run report")?);
    }
    Ok(report.exit_code())
}
