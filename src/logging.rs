/// Structured logging for the turbine ingestion service.
///
/// Installs a `tracing` fmt subscriber writing to stderr or, for scheduled
/// runs, appending to a log file. `RUST_LOG` overrides the configured level.
///
/// Per-item failures are classified before logging so that routine problems
/// (a held-back reading on an early run) do not drown out the ones an
/// operator must act on (a truncated export, a failed write).

use std::fmt;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::model::{ErrorKind, PipelineError};

// ---------------------------------------------------------------------------
// Initialization
// ---------------------------------------------------------------------------

/// Installs the global subscriber.
///
/// `level` is an `EnvFilter` directive such as `info` or
/// `turbine_service=debug`. Calling this twice keeps the first subscriber.
pub fn init_logger(level: &str, log_file: Option<&Path>) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init(),
    };
    if installed.is_err() {
        debug!("logger already initialized");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Failure Classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Routine; resolves itself on a later run.
    Expected,
    /// Needs an operator: bad export, broken store.
    Unexpected,
    /// Could be either; worth a look.
    Unknown,
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureType::Expected => write!(f, "EXPECTED"),
            FailureType::Unexpected => write!(f, "UNEXPECTED"),
            FailureType::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

pub fn classify_failure(kind: ErrorKind) -> FailureType {
    match kind {
        // Not enough history yet; retried automatically.
        ErrorKind::UndefinedStatistic => FailureType::Expected,
        ErrorKind::OutOfOrderData | ErrorKind::Integrity | ErrorKind::Persistence => {
            FailureType::Unexpected
        }
        // A stray malformed row, or a day with only anomalies.
        ErrorKind::SourceRead | ErrorKind::StatisticsComputation => FailureType::Unknown,
    }
}

/// Logs `err` at a level matching its classification.
pub fn log_failure(stage: &str, err: &PipelineError) {
    let kind = err.kind();
    let failure = classify_failure(kind);
    match failure {
        FailureType::Expected => debug!(stage, %kind, %failure, "{}", err),
        FailureType::Unexpected => error!(stage, %kind, %failure, "{}", err),
        FailureType::Unknown => warn!(stage, %kind, %failure, "{}", err),
    }
}

// ---------------------------------------------------------------------------
// Stage Summary Logging
// ---------------------------------------------------------------------------

/// Logs a stage's totals: info when nothing failed, error when nothing
/// succeeded, warn otherwise.
pub fn log_stage_summary(stage: &str, total: usize, successful: usize, failed: usize) {
    if failed == 0 {
        info!(stage, total, successful, failed, "stage complete");
    } else if successful == 0 && total > 0 {
        error!(stage, total, successful, failed, "stage failed");
    } else {
        warn!(stage, total, successful, failed, "stage complete with failures");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
