/// Reading, IngestionCursor, StatSnapshot, DailySummary, DailyAnomalyCount,
/// PipelineError.
///
/// Core data types for the wind turbine ingestion and cleaning service.
///
/// This module defines the shared domain model imported by all other modules.
/// It holds no I/O. The error types of the other layers (`StoreError`,
/// `StatsError`) are wrapped here so that every per-item failure of a run can
/// be classified with a single `ErrorKind`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::statistics::StatsError;
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// CSV layout
// ---------------------------------------------------------------------------

/// Column names every turbine export must carry. Order in the file may vary.
pub const CSV_COLUMNS: [&str; 5] = [
    "turbine_id",
    "timestamp",
    "wind_speed",
    "wind_direction",
    "power_output",
];

// ---------------------------------------------------------------------------
// Metrics and periods
// ---------------------------------------------------------------------------

/// One of the three numeric measurements carried by a `Reading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    WindSpeed,
    WindDirection,
    PowerOutput,
}

impl Metric {
    pub const ALL: [Metric; 3] = [Metric::WindSpeed, Metric::WindDirection, Metric::PowerOutput];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::WindSpeed => "wind_speed",
            Metric::WindDirection => "wind_direction",
            Metric::PowerOutput => "power_output",
        }
    }

    /// The reading's value for this metric, `None` when absent.
    pub fn value_of(&self, reading: &Reading) -> Option<f64> {
        match self {
            Metric::WindSpeed => reading.wind_speed,
            Metric::WindDirection => reading.wind_direction,
            Metric::PowerOutput => reading.power_output,
        }
    }

    fn slot<'a>(&self, reading: &'a mut Reading) -> &'a mut Option<f64> {
        match self {
            Metric::WindSpeed => &mut reading.wind_speed,
            Metric::WindDirection => &mut reading.wind_direction,
            Metric::PowerOutput => &mut reading.power_output,
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| format!("unknown metric '{}'", s))
    }
}

/// Rolling statistics windows, all ending at the run's reference instant.
///
/// Window lengths for the bounded periods come from `config::WindowConfig`
/// (28/14/7/1 days by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Full,
    Last4Weeks,
    Last2Weeks,
    LastWeek,
    LastDay,
}

impl Period {
    pub const ALL: [Period; 5] = [
        Period::Full,
        Period::Last4Weeks,
        Period::Last2Weeks,
        Period::LastWeek,
        Period::LastDay,
    ];

    /// Narrowest first. Imputation walks this list until a median is defined.
    pub const IMPUTATION_ORDER: [Period; 5] = [
        Period::LastDay,
        Period::LastWeek,
        Period::Last2Weeks,
        Period::Last4Weeks,
        Period::Full,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Full => "full",
            Period::Last4Weeks => "last_4_weeks",
            Period::Last2Weeks => "last_2_weeks",
            Period::LastWeek => "last_week",
            Period::LastDay => "last_day",
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Period {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Period::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown period '{}'", s))
    }
}

// ---------------------------------------------------------------------------
// Reading types
// ---------------------------------------------------------------------------

/// A single turbine measurement, one CSV row.
///
/// The natural key is `(turbine_id, timestamp)`. The raw, clean and anomaly
/// stores each enforce it independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub turbine_id: i32,
    pub timestamp: DateTime<Utc>,
    pub wind_speed: Option<f64>,
    pub wind_direction: Option<f64>,
    pub power_output: Option<f64>,
}

impl Reading {
    pub fn key(&self) -> (i32, DateTime<Utc>) {
        (self.turbine_id, self.timestamp)
    }

    /// UTC calendar day the reading belongs to for daily aggregation.
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// True when all three numeric fields are present.
    pub fn is_complete(&self) -> bool {
        Metric::ALL.iter().all(|m| m.value_of(self).is_some())
    }

    /// Metrics whose value is absent, in `Metric::ALL` order.
    pub fn missing_metrics(&self) -> Vec<Metric> {
        Metric::ALL
            .into_iter()
            .filter(|m| m.value_of(self).is_none())
            .collect()
    }

    pub fn set_metric(&mut self, metric: Metric, value: f64) {
        *metric.slot(self) = Some(value);
    }
}

/// Per-source ingestion position.
///
/// `last_row_index` counts data rows from 1 (the header is not a row). A
/// cursor at row 0 has consumed nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionCursor {
    pub source_id: String,
    pub last_timestamp: DateTime<Utc>,
    pub last_row_index: u64,
    pub updated_at: DateTime<Utc>,
}

impl IngestionCursor {
    /// True when `self` is at or beyond `other`'s position.
    pub fn is_at_or_after(&self, other: &IngestionCursor) -> bool {
        self.last_row_index >= other.last_row_index && self.last_timestamp >= other.last_timestamp
    }
}

// ---------------------------------------------------------------------------
// Statistics and summary types
// ---------------------------------------------------------------------------

/// Descriptive statistics of one metric over one window, as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatSnapshot {
    pub period: Period,
    pub metric: Metric,
    pub mean: f64,
    pub median: f64,
    pub mode: f64,
    /// Sample standard deviation; `None` below two observations.
    pub std_dev: Option<f64>,
    pub observations: usize,
    pub computed_at: DateTime<Utc>,
}

/// Daily power output summary for one turbine over its clean readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailySummary {
    pub day: NaiveDate,
    pub turbine_id: i32,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyAnomalyCount {
    pub day: NaiveDate,
    pub turbine_id: i32,
    pub count: i64,
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Classification of a per-item failure, used for run report counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceRead,
    OutOfOrderData,
    Integrity,
    UndefinedStatistic,
    Persistence,
    StatisticsComputation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::SourceRead => "SOURCE_READ",
            ErrorKind::OutOfOrderData => "OUT_OF_ORDER",
            ErrorKind::Integrity => "INTEGRITY",
            ErrorKind::UndefinedStatistic => "UNDEFINED_STATISTIC",
            ErrorKind::Persistence => "PERSISTENCE",
            ErrorKind::StatisticsComputation => "STATISTICS",
        };
        f.write_str(name)
    }
}

/// Errors that can arise for a single source, row, turbine or day during a
/// pipeline run. None of them aborts the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A CSV row (or the whole file, `row == 0`) could not be read.
    #[error("source {source_id} row {row}: {message}")]
    SourceRead {
        source_id: String,
        row: u64,
        message: String,
    },

    /// A row's timestamp precedes the cursor or the previous accepted row.
    #[error("source {source_id} row {row}: timestamp {timestamp} precedes {previous}")]
    OutOfOrderData {
        source_id: String,
        row: u64,
        timestamp: DateTime<Utc>,
        previous: DateTime<Utc>,
    },

    /// The source contradicts its declaration or its own cursor.
    #[error("source {source_id}: {message}")]
    Integrity { source_id: String, message: String },

    /// A statistic needed to clean a row is undefined in every window.
    #[error("turbine {turbine_id} at {timestamp}: {source}")]
    UndefinedStatistic {
        turbine_id: i32,
        timestamp: DateTime<Utc>,
        source: StatsError,
    },

    #[error("persistence failure: {0}")]
    Persistence(#[from] StoreError),

    /// A daily summary could not be computed for the key.
    #[error("summary for turbine {turbine_id} on {day}: {message}")]
    StatisticsComputation {
        day: NaiveDate,
        turbine_id: i32,
        message: String,
    },
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SourceRead { .. } => ErrorKind::SourceRead,
            PipelineError::OutOfOrderData { .. } => ErrorKind::OutOfOrderData,
            PipelineError::Integrity { .. } => ErrorKind::Integrity,
            PipelineError::UndefinedStatistic { .. } => ErrorKind::UndefinedStatistic,
            PipelineError::Persistence(_) => ErrorKind::Persistence,
            PipelineError::StatisticsComputation { .. } => ErrorKind::StatisticsComputation,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn reading() -> Reading {
        Reading {
            turbine_id: 1,
            timestamp: Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 0).unwrap(),
            wind_speed: Some(5.0),
            wind_direction: None,
            power_output: Some(2.0),
        }
    }

    #[test]
    fn test_metric_and_period_names_round_trip_through_from_str() {
        for metric in Metric::ALL {
            assert_eq!(metric.as_str().parse::<Metric>(), Ok(metric));
        }
        for period in Period::ALL {
            assert_eq!(period.as_str().parse::<Period>(), Ok(period));
        }
        assert!("rotor_rpm".parse::<Metric>().is_err());
    }

    #[test]
    fn test_imputation_order_is_narrowest_first_and_covers_every_period() {
        assert_eq!(Period::IMPUTATION_ORDER.first(), Some(&Period::LastDay));
        assert_eq!(Period::IMPUTATION_ORDER.last(), Some(&Period::Full));
        for period in Period::ALL {
            assert!(Period::IMPUTATION_ORDER.contains(&period));
        }
    }

    #[test]
    fn test_missing_metrics_and_set_metric() {
        let mut r = reading();
        assert!(!r.is_complete());
        assert_eq!(r.missing_metrics(), vec![Metric::WindDirection]);

        r.set_metric(Metric::WindDirection, 185.0);
        assert!(r.is_complete());
        assert_eq!(Metric::WindDirection.value_of(&r), Some(185.0));
    }

    #[test]
    fn test_reading_day_uses_utc_calendar_date() {
        // 23:30 UTC stays on the same day regardless of local offsets.
        assert_eq!(reading().day(), NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn test_error_kind_matches_variant() {
        let err = PipelineError::Integrity {
            source_id: "data_group_1.csv".to_string(),
            message: "truncated".to_string(),
        };
        assert_eq!(err.kind(), ErrorKind::Integrity);
        assert!(err.to_string().contains("data_group_1.csv"));
    }
}
