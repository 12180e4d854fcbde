/// Per-source cursor tracking.
///
/// Sources are append-only exports sorted by timestamp. Given the rows of a
/// source and its persisted cursor, `next_batch` selects the rows not yet
/// ingested and computes the cursor to persist alongside them. It performs no
/// I/O; `Store::commit_raw_batch` writes the batch and the cursor together.
///
/// # Clock injection
/// `next_batch` takes `now` for the cursor's `updated_at` instead of calling
/// `Utc::now()` so tests are deterministic.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::ingest::csv_source::SourceRow;
use crate::model::{ErrorKind, IngestionCursor, PipelineError, Reading};
use crate::sources::SourceDeclaration;

/// Rows selected from one source on one run.
#[derive(Debug)]
pub struct Batch {
    pub readings: Vec<Reading>,
    /// Cursor to persist with `readings`; `None` when no new row was examined.
    pub advanced_cursor: Option<IngestionCursor>,
    /// Examined rows that were skipped, one error each.
    pub rejected: Vec<PipelineError>,
}

impl Batch {
    /// Out-of-order or integrity problems need an operator to look at the
    /// source.
    pub fn needs_review(&self) -> bool {
        self.rejected
            .iter()
            .any(|e| matches!(e.kind(), ErrorKind::OutOfOrderData | ErrorKind::Integrity))
    }

    pub fn examined(&self) -> usize {
        self.readings.len() + self.rejected.len()
    }
}

/// Selects rows beyond `cursor` and validates them.
///
/// - rows at or below the cursor's row index are skipped silently
/// - a row older than the cursor or the previous accepted row is
///   `OutOfOrderData`
/// - a row for a turbine its declaration does not list is `Integrity`
/// - a row repeating the (turbine, timestamp) key of a row accepted earlier
///   in the same batch is `Integrity`; the first occurrence wins
/// - a source with fewer rows than the cursor's row index was truncated or
///   replaced; the whole source is an `Integrity` error and nothing is
///   selected
///
/// The advanced cursor covers every examined row so rejected rows are
/// reported once. Its timestamp is the last accepted row's, else the prior
/// cursor's, else the last rejected row's. If nothing carries a timestamp the
/// cursor is not created and the rows are re-examined next run.
pub fn next_batch(
    source_id: &str,
    rows: &[SourceRow],
    cursor: Option<&IngestionCursor>,
    declaration: Option<&SourceDeclaration>,
    now: DateTime<Utc>,
) -> Result<Batch, PipelineError> {
    let consumed = cursor.map_or(0, |c| c.last_row_index);
    let available = rows.last().map_or(0, |r| r.index);
    if available < consumed {
        return Err(PipelineError::Integrity {
            source_id: source_id.to_string(),
            message: format!(
                "source has {} rows but cursor is at row {}; truncated or replaced",
                available, consumed
            ),
        });
    }

    let mut readings: Vec<Reading> = Vec::new();
    let mut rejected = Vec::new();
    let mut last_index = None;
    let mut rejected_timestamp = None;
    let mut seen: HashSet<(i32, DateTime<Utc>)> = HashSet::new();

    for row in rows.iter().filter(|r| r.index > consumed) {
        last_index = Some(row.index);

        let reading = match &row.parsed {
            Ok(r) => r,
            Err(message) => {
                rejected.push(PipelineError::SourceRead {
                    source_id: source_id.to_string(),
                    row: row.index,
                    message: message.clone(),
                });
                continue;
            }
        };

        let previous = readings
            .last()
            .map(|r| r.timestamp)
            .or(cursor.map(|c| c.last_timestamp));
        if let Some(previous) = previous.filter(|p| reading.timestamp < *p) {
            rejected.push(PipelineError::OutOfOrderData {
                source_id: source_id.to_string(),
                row: row.index,
                timestamp: reading.timestamp,
                previous,
            });
            continue;
        }

        if let Some(decl) = declaration.filter(|d| !d.declares_turbine(reading.turbine_id)) {
            rejected.push(PipelineError::Integrity {
                source_id: source_id.to_string(),
                message: format!(
                    "row {}: turbine {} is not declared for {}",
                    row.index, reading.turbine_id, decl.id
                ),
            });
            rejected_timestamp = Some(reading.timestamp);
            continue;
        }

        if !seen.insert(reading.key()) {
            rejected.push(PipelineError::Integrity {
                source_id: source_id.to_string(),
                message: format!(
                    "row {}: duplicate reading for turbine {} at {}",
                    row.index, reading.turbine_id, reading.timestamp
                ),
            });
            continue;
        }

        readings.push(reading.clone());
    }

    let last_timestamp = readings
        .last()
        .map(|r| r.timestamp)
        .or(cursor.map(|c| c.last_timestamp))
        .or(rejected_timestamp);

    let advanced_cursor = match (last_index, last_timestamp) {
        (Some(last_row_index), Some(last_timestamp)) => Some(IngestionCursor {
            source_id: source_id.to_string(),
            last_timestamp,
            last_row_index,
            updated_at: now,
        }),
        _ => None,
    };

    Ok(Batch {
        readings,
        advanced_cursor,
        rejected,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
