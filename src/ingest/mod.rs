//! Ingestion of turbine CSV exports into the raw store.
//!
//! Submodules:
//! - `csv_source`:  discovers and parses export files.
//! - `tracker`:     selects rows beyond each source's cursor.
//! - `consistency`: reports sources lagging behind the others.
//!
//! Each source is ingested independently: a failure in one never stops the
//! others, and a failed write leaves that source's cursor where it was.

pub mod consistency;
pub mod csv_source;
pub mod tracker;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::archive::ConsumedSourceHook;
use crate::config::PipelineConfig;
use crate::logging::log_failure;
use crate::model::{IngestionCursor, PipelineError};
use crate::store::Store;
use csv_source::{SourceFile, discover_sources, read_source};
use tracker::next_batch;

/// Result of ingesting one source.
#[derive(Debug)]
pub struct SourceOutcome {
    pub source_id: String,
    /// Rows past the previous cursor, accepted or not.
    pub examined: usize,
    /// New raw rows written; re-written duplicates are not counted.
    pub inserted: usize,
    /// Accepted rows whose key was already in the raw store.
    pub duplicates_ignored: usize,
    /// Cursor committed by this run, `None` if it did not move.
    pub cursor: Option<IngestionCursor>,
    pub errors: Vec<PipelineError>,
    pub needs_review: bool,
    pub archived: Option<PathBuf>,
}

impl SourceOutcome {
    fn new(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            examined: 0,
            inserted: 0,
            duplicates_ignored: 0,
            cursor: None,
            errors: Vec::new(),
            needs_review: false,
            archived: None,
        }
    }
}

/// Result of ingesting every discovered source.
#[derive(Debug, Default)]
pub struct IngestRun {
    pub sources: Vec<SourceOutcome>,
    /// Failures not tied to a single source (discovery).
    pub errors: Vec<PipelineError>,
}

impl IngestRun {
    pub fn inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    pub fn all_errors(&self) -> impl Iterator<Item = &PipelineError> {
        self.errors
            .iter()
            .chain(self.sources.iter().flat_map(|s| s.errors.iter()))
    }

    pub fn sources_needing_review(&self) -> Vec<&str> {
        self.sources
            .iter()
            .filter(|s| s.needs_review)
            .map(|s| s.source_id.as_str())
            .collect()
    }
}

/// Reads `source`, appends its new rows to the raw store and advances its
/// cursor in one store call, then signals `hook` if the source was consumed
/// without problems.
pub fn ingest_source(
    store: &mut dyn Store,
    source: &SourceFile,
    config: &PipelineConfig,
    hook: &dyn ConsumedSourceHook,
    now: DateTime<Utc>,
) -> SourceOutcome {
    let mut outcome = SourceOutcome::new(&source.id);

    let rows = match read_source(&source.path, &config.timestamp_format) {
        Ok(rows) => rows,
        Err(e) => {
            outcome.errors.push(PipelineError::SourceRead {
                source_id: source.id.clone(),
                row: 0,
                message: e.to_string(),
            });
            return outcome;
        }
    };

    let cursor = match store.load_cursor(&source.id) {
        Ok(cursor) => cursor,
        Err(e) => {
            outcome.errors.push(PipelineError::Persistence(e));
            return outcome;
        }
    };

    let batch = match next_batch(
        &source.id,
        &rows,
        cursor.as_ref(),
        config.find_source(&source.id),
        now,
    ) {
        Ok(batch) => batch,
        Err(e) => {
            outcome.needs_review = true;
            outcome.errors.push(e);
            return outcome;
        }
    };

    outcome.examined = batch.examined();
    outcome.needs_review = batch.needs_review();

    if let Some(advanced) = &batch.advanced_cursor {
        match store.commit_raw_batch(&batch.readings, advanced) {
            Ok(inserted) => {
                outcome.inserted = inserted;
                outcome.duplicates_ignored = batch.readings.len().saturating_sub(inserted);
                if outcome.duplicates_ignored > 0 {
                    warn!(
                        source = %source.id,
                        ignored = outcome.duplicates_ignored,
                        "rows already present in raw store"
                    );
                }
                outcome.cursor = Some(advanced.clone());
            }
            Err(e) => {
                outcome.errors.extend(batch.rejected);
                outcome.errors.push(PipelineError::Persistence(e));
                return outcome;
            }
        }
    } else {
        debug!(source = %source.id, "no new rows");
    }

    outcome.errors.extend(batch.rejected);

    if outcome.errors.is_empty() && !outcome.needs_review {
        match hook.source_consumed(source, now) {
            Ok(dest) => outcome.archived = dest,
            Err(e) => warn!(source = %source.id, error = %e, "could not archive consumed source"),
        }
    }

    outcome
}

/// Ingests every source discovered under `config.source_dir`.
pub fn ingest_all(
    store: &mut dyn Store,
    config: &PipelineConfig,
    hook: &dyn ConsumedSourceHook,
    now: DateTime<Utc>,
) -> IngestRun {
    let mut run = IngestRun::default();

    let sources = match discover_sources(config) {
        Ok(sources) => sources,
        Err(e) => {
            run.errors.push(PipelineError::SourceRead {
                source_id: config.source_dir.display().to_string(),
                row: 0,
                message: e.to_string(),
            });
            return run;
        }
    };
    if sources.is_empty() {
        warn!(dir = %config.source_dir.display(), prefix = %config.source_prefix, "no source files found");
    }

    for source in &sources {
        let outcome = ingest_source(store, source, config, hook, now);
        for e in &outcome.errors {
            log_failure("ingest", e);
        }
        info!(
            source = %outcome.source_id,
            examined = outcome.examined,
            inserted = outcome.inserted,
            duplicates = outcome.duplicates_ignored,
            errors = outcome.errors.len(),
            review = outcome.needs_review,
            "source ingested"
        );
        run.sources.push(outcome);
    }

    run
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
