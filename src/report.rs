//! Run Report
//!
//! Totals of one pipeline invocation, per stage, plus every per-item failure
//! counted by `ErrorKind`. Logged and printed as JSON at the end of a run; the
//! exit code is derived from it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::analysis::cleaning::CleanOutcome;
use crate::analysis::summary::SummaryRun;
use crate::ingest::IngestRun;
use crate::ingest::consistency::SourceLag;
use crate::logging::log_stage_summary;
use crate::model::{ErrorKind, PipelineError};

/// Error messages kept verbatim in the report; the rest are only counted.
pub const MAX_REPORTED_ERRORS: usize = 50;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FATAL: u8 = 1;
pub const EXIT_PARTIAL_FAILURE: u8 = 2;

// ============================================================================
// Report Structures
// ============================================================================

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub sources: usize,
    pub sources_failed: usize,
    pub rows_examined: usize,
    pub rows_inserted: usize,
    /// Accepted rows already present in the raw store.
    pub duplicates_ignored: usize,
    pub sources_needing_review: Vec<String>,
    pub sources_archived: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StatisticsSummary {
    pub as_of: Option<DateTime<Utc>>,
    pub history_rows: usize,
    pub snapshots_saved: usize,
    /// `period/metric` pairs with no observations.
    pub undefined: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleaningSummary {
    pub pending: usize,
    pub clean: usize,
    pub anomalies: usize,
    pub unresolved: usize,
    pub imputed_fields: usize,
    /// Rows the store accepted; lower than `clean`/`anomalies` when a
    /// concurrent run wrote some of them first.
    pub clean_written: usize,
    pub anomalies_written: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SummaryTotals {
    pub keys: usize,
    pub summaries_written: usize,
    pub anomaly_counts_written: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportedError {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub ingest: IngestSummary,
    pub lagging_sources: Vec<SourceLag>,
    pub statistics: StatisticsSummary,
    pub cleaning: CleaningSummary,
    pub summaries: SummaryTotals,
    pub counts_by_kind: BTreeMap<ErrorKind, usize>,
    pub errors: Vec<ReportedError>,
}

impl RunReport {
    pub fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            started_at,
            finished_at: None,
            dry_run: false,
            ingest: IngestSummary::default(),
            lagging_sources: Vec::new(),
            statistics: StatisticsSummary::default(),
            cleaning: CleaningSummary::default(),
            summaries: SummaryTotals::default(),
            counts_by_kind: BTreeMap::new(),
            errors: Vec::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Recording
    // ------------------------------------------------------------------------

    pub fn record_error(&mut self, err: &PipelineError) {
        *self.counts_by_kind.entry(err.kind()).or_insert(0) += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(ReportedError {
                kind: err.kind(),
                message: err.to_string(),
            });
        }
    }

    pub fn record_ingest(&mut self, run: &IngestRun) {
        self.ingest = IngestSummary {
            sources: run.sources.len(),
            sources_failed: run.sources.iter().filter(|s| !s.errors.is_empty()).count(),
            rows_examined: run.sources.iter().map(|s| s.examined).sum(),
            rows_inserted: run.inserted(),
            duplicates_ignored: run.sources.iter().map(|s| s.duplicates_ignored).sum(),
            sources_needing_review: run
                .sources_needing_review()
                .into_iter()
                .map(String::from)
                .collect(),
            sources_archived: run.sources.iter().filter(|s| s.archived.is_some()).count(),
        };
        for err in run.all_errors() {
            self.record_error(err);
        }
        log_stage_summary(
            "ingest",
            self.ingest.sources,
            self.ingest.sources - self.ingest.sources_failed,
            self.ingest.sources_failed + run.errors.len(),
        );
    }

    /// Unresolved readings are counted as `UndefinedStatistic` failures.
    pub fn record_cleaning(&mut self, outcome: &CleanOutcome) {
        self.cleaning = CleaningSummary {
            pending: outcome.total(),
            clean: outcome.clean.len(),
            anomalies: outcome.anomalies.len(),
            unresolved: outcome.unresolved.len(),
            imputed_fields: outcome.imputed_fields,
            clean_written: outcome.written.clean,
            anomalies_written: outcome.written.anomalies,
        };
        for held in &outcome.unresolved {
            self.record_error(&PipelineError::UndefinedStatistic {
                turbine_id: held.reading.turbine_id,
                timestamp: held.reading.timestamp,
                source: held.reason.clone(),
            });
        }
        log_stage_summary(
            "clean",
            outcome.total(),
            outcome.written.clean + outcome.written.anomalies,
            outcome.unresolved.len(),
        );
    }

    pub fn record_summaries(&mut self, run: &SummaryRun) {
        self.summaries = SummaryTotals {
            keys: run.keys,
            summaries_written: run.summaries_written,
            anomaly_counts_written: run.counts_written,
        };
        for err in &run.errors {
            self.record_error(err);
        }
        log_stage_summary("summarize", run.keys, run.summaries_written, run.errors.len());
    }

    pub fn finish(&mut self, at: DateTime<Utc>) {
        self.finished_at = Some(at);
    }

    // ------------------------------------------------------------------------
    // Outcome
    // ------------------------------------------------------------------------

    pub fn error_count(&self) -> usize {
        self.counts_by_kind.values().sum()
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.counts_by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// 0 when nothing failed, 2 when any item failed.
    pub fn exit_code(&self) -> u8 {
        if self.error_count() == 0 {
            EXIT_SUCCESS
        } else {
            EXIT_PARTIAL_FAILURE
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

pub fn print_summary(report: &RunReport) {
    println!("══════════════════════════════════════════════════════════");
    println!("TURBINE PIPELINE RUN");
    println!("══════════════════════════════════════════════════════════");
    println!();
    println!(
        "Ingest:     {} sources, {} rows examined, {} inserted, {} already stored ({} failed)",
        report.ingest.sources,
        report.ingest.rows_examined,
        report.ingest.rows_inserted,
        report.ingest.duplicates_ignored,
        report.ingest.sources_failed
    );
    if !report.ingest.sources_needing_review.is_empty() {
        println!("Review:     {}", report.ingest.sources_needing_review.join(", "));
    }
    for lag in &report.lagging_sources {
        println!(
            "Lagging:    {} is {} min behind ({})",
            lag.source_id, lag.lag_minutes, lag.last_timestamp
        );
    }
    println!(
        "Cleaning:   {} clean, {} anomalies, {} held back, {} fields imputed",
        report.cleaning.clean_written,
        report.cleaning.anomalies_written,
        report.cleaning.unresolved,
        report.cleaning.imputed_fields
    );
    println!(
        "Summaries:  {}/{} days written",
        report.summaries.summaries_written, report.summaries.keys
    );
    println!();
    if report.counts_by_kind.is_empty() {
        println!("No errors.");
    } else {
        for (kind, count) in &report.counts_by_kind {
            println!("  {:<20} {}", kind.to_string(), count);
        }
    }
    println!("══════════════════════════════════════════════════════════");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 2, 6, 0, 0).unwrap()
    }

    fn integrity(n: usize) -> PipelineError {
        PipelineError::Integrity {
            source_id: "data_group_1.csv".to_string(),
            message: format!("row {}: turbine 99 is not declared", n),
        }
    }

    #[test]
    fn test_clean_run_exits_zero() {
        let report = RunReport::new(fixed_now());
        assert_eq!(report.error_count(), 0);
        assert_eq!(report.exit_code(), EXIT_SUCCESS);
    }

    #[test]
    fn test_errors_are_counted_by_kind_and_set_partial_exit() {
        let mut report = RunReport::new(fixed_now());
        report.record_error(&integrity(1));
        report.record_error(&integrity(2));
        report.record_error(&PipelineError::StatisticsComputation {
            day: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            turbine_id: 3,
            message: "no clean power output readings".to_string(),
        });

        assert_eq!(report.count(ErrorKind::Integrity), 2);
        assert_eq!(report.count(ErrorKind::StatisticsComputation), 1);
        assert_eq!(report.count(ErrorKind::Persistence), 0);
        assert_eq!(report.exit_code(), EXIT_PARTIAL_FAILURE);
    }

    #[test]
    fn test_messages_are_capped_but_counts_are_not() {
        let mut report = RunReport::new(fixed_now());
        for n in 0..(MAX_REPORTED_ERRORS + 10) {
            report.record_error(&integrity(n));
        }
        assert_eq!(report.errors.len(), MAX_REPORTED_ERRORS);
        assert_eq!(report.error_count(), MAX_REPORTED_ERRORS + 10);
    }

    #[test]
    fn test_cleaning_totals_carry_written_counts() {
        use crate::analysis::cleaning::CleanOutcome;
        use crate::store::CleanedWrite;

        let outcome = CleanOutcome {
            written: CleanedWrite { clean: 3, anomalies: 1 },
            ..CleanOutcome::default()
        };
        let mut report = RunReport::new(fixed_now());
        report.record_cleaning(&outcome);
        assert_eq!(report.cleaning.clean_written, 3);
        assert_eq!(report.cleaning.anomalies_written, 1);
        assert!(report.to_json().unwrap().contains("\"clean_written\": 3"));
    }

    #[test]
    fn test_json_uses_snake_case_kinds() {
        let mut report = RunReport::new(fixed_now());
        report.record_error(&integrity(1));
        report.finish(fixed_now());
        let json = report.to_json().unwrap();
        assert!(json.contains("\"counts_by_kind\""));
        assert!(json.contains("\"integrity\": 1"), "got: {}", json);
    }
}
