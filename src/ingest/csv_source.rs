/// Turbine CSV exports.
///
/// Each export is a header line followed by one reading per line:
///
/// ```text
/// timestamp,turbine_id,wind_speed,wind_direction,power_output
/// 2024-03-01 00:00:00,1,11.8,169,2.7
/// 2024-03-01 00:00:00,2,11.6,24,
/// ```
///
/// Column order may vary and extra columns are ignored. Rows are numbered from
/// 1 (the first data row) and every row is returned, parsed or not, so the
/// tracker can account for malformed rows too.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use csv::{ReaderBuilder, StringRecord, Trim};
use thiserror::Error;

use crate::config::PipelineConfig;
use crate::model::{CSV_COLUMNS, Reading};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{} has no '{column}' column", path.display())]
    MissingColumn { path: PathBuf, column: String },
}

/// A discovered export. The id is the file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub id: String,
    pub path: PathBuf,
}

/// One data row: its 1-based index and the parsed reading or why it failed.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRow {
    pub index: u64,
    pub parsed: Result<Reading, String>,
}

// ---------------------------------------------------------------------------
// Discovery
// ---------------------------------------------------------------------------

/// Lists `<source_prefix>*.csv` files in `config.source_dir`, sorted by name.
pub fn discover_sources(config: &PipelineConfig) -> Result<Vec<SourceFile>, SourceError> {
    let dir = &config.source_dir;
    let entries = fs::read_dir(dir).map_err(|source| SourceError::Io {
        path: dir.clone(),
        source,
    })?;

    let mut sources = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| SourceError::Io {
            path: dir.clone(),
            source,
        })?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with(&config.source_prefix) && name.ends_with(".csv") {
            sources.push(SourceFile {
                id: name.to_string(),
                path: path.clone(),
            });
        }
    }

    sources.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(sources)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Positions of the required columns within the header.
struct ColumnIndex {
    turbine_id: usize,
    timestamp: usize,
    wind_speed: usize,
    wind_direction: usize,
    power_output: usize,
}

impl ColumnIndex {
    fn from_headers(path: &Path, headers: &StringRecord) -> Result<Self, SourceError> {
        let find = |name: &str| {
            headers
                .iter()
                .position(|h| h.trim().eq_ignore_ascii_case(name))
                .ok_or_else(|| SourceError::MissingColumn {
                    path: path.to_path_buf(),
                    column: name.to_string(),
                })
        };
        let [turbine_id, timestamp, wind_speed, wind_direction, power_output] = CSV_COLUMNS;
        Ok(Self {
            turbine_id: find(turbine_id)?,
            timestamp: find(timestamp)?,
            wind_speed: find(wind_speed)?,
            wind_direction: find(wind_direction)?,
            power_output: find(power_output)?,
        })
    }
}

/// Reads every data row of the export at `path`.
///
/// Only file-level problems (unreadable file, missing header column) are
/// errors; row-level problems are carried in `SourceRow::parsed`.
pub fn read_source(path: &Path, timestamp_format: &str) -> Result<Vec<SourceRow>, SourceError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)
        .map_err(|source| SourceError::Csv {
            path: path.to_path_buf(),
            source,
        })?;

    let headers = reader
        .headers()
        .map_err(|source| SourceError::Csv {
            path: path.to_path_buf(),
            source,
        })?
        .clone();
    let columns = ColumnIndex::from_headers(path, &headers)?;

    let mut rows = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let index = i as u64 + 1;
        let parsed = match record {
            Ok(record) if record.len() != headers.len() => Err(format!(
                "expected {} fields, found {}",
                headers.len(),
                record.len()
            )),
            Ok(record) => parse_record(&record, &columns, timestamp_format),
            Err(e) => Err(e.to_string()),
        };
        rows.push(SourceRow { index, parsed });
    }

    Ok(rows)
}

fn parse_record(
    record: &StringRecord,
    columns: &ColumnIndex,
    timestamp_format: &str,
) -> Result<Reading, String> {
    let field = |i: usize| record.get(i).unwrap_or("");

    let raw_id = field(columns.turbine_id);
    let turbine_id = raw_id
        .parse::<i32>()
        .map_err(|_| format!("invalid turbine_id '{}'", raw_id))?;
    let timestamp = parse_timestamp(field(columns.timestamp), timestamp_format)?;

    Ok(Reading {
        turbine_id,
        timestamp,
        wind_speed: parse_value("wind_speed", field(columns.wind_speed))?,
        wind_direction: parse_value("wind_direction", field(columns.wind_direction))?,
        power_output: parse_value("power_output", field(columns.power_output))?,
    })
}

/// Parses with `format` as UTC, falling back to RFC 3339.
pub fn parse_timestamp(s: &str, format: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
        return Ok(naive.and_utc());
    }
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| format!("invalid timestamp '{}'", s))
}

/// Empty, `NaN` and `null` are absent values.
fn parse_value(column: &str, s: &str) -> Result<Option<f64>, String> {
    if s.is_empty() || s.eq_ignore_ascii_case("nan") || s.eq_ignore_ascii_case("null") {
        return Ok(None);
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(format!("invalid {} '{}'", column, s)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
