/// Daily pipeline run: ingest → statistics → clean → summarize.
///
/// Stages run sequentially against one `Store`. No per-item failure aborts
/// the run; each is recorded in the returned `RunReport`. A stage whose input
/// cannot be read from the store is skipped along with the stages that depend
/// on it, and the next invocation picks up where this one stopped because
/// cursors and "pending" rows are derived from the store.
///
/// # Clock injection
/// `now` stamps cursors, snapshots and archive names. Statistics windows are
/// anchored at the newest raw timestamp, not at `now`, so replaying historical
/// exports behaves like a live run.

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use crate::analysis::cleaning::clean_pending;
use crate::analysis::statistics::CleaningSnapshot;
use crate::analysis::summary::{all_summary_keys, summarize_days};
use crate::archive::ConsumedSourceHook;
use crate::config::PipelineConfig;
use crate::ingest::consistency::lagging_sources;
use crate::ingest::ingest_all;
use crate::model::PipelineError;
use crate::report::RunReport;
use crate::store::Store;

pub fn run(
    store: &mut dyn Store,
    config: &PipelineConfig,
    hook: &dyn ConsumedSourceHook,
    now: DateTime<Utc>,
) -> RunReport {
    let mut report = RunReport::new(now);

    // --- Ingest -----------------------------------------------------------
    let ingested = ingest_all(store, config, hook, now);
    report.record_ingest(&ingested);

    match store.load_cursors() {
        Ok(cursors) => {
            report.lagging_sources = lagging_sources(&cursors, config.max_source_lag());
            for lag in &report.lagging_sources {
                warn!(
                    source = %lag.source_id,
                    last_timestamp = %lag.last_timestamp,
                    lag_minutes = lag.lag_minutes,
                    "source lags behind the newest export"
                );
            }
        }
        Err(e) => report.record_error(&PipelineError::Persistence(e)),
    }

    // --- Statistics -------------------------------------------------------
    let as_of = match store.latest_raw_timestamp() {
        Ok(Some(as_of)) => as_of,
        Ok(None) => {
            info!("raw store is empty, nothing to clean");
            report.finish(now);
            return report;
        }
        Err(e) => {
            report.record_error(&PipelineError::Persistence(e));
            report.finish(now);
            return report;
        }
    };

    let history = match store.statistics_history() {
        Ok(history) => history,
        Err(e) => {
            report.record_error(&PipelineError::Persistence(e));
            report.finish(now);
            return report;
        }
    };

    let snapshot = CleaningSnapshot::build(
        &history,
        as_of,
        &config.windows,
        config.outlier_sigma,
        now,
    );
    report.statistics.as_of = Some(as_of);
    report.statistics.history_rows = history.len();
    report.statistics.undefined = snapshot
        .undefined()
        .into_iter()
        .map(|(period, metric)| format!("{}/{}", period, metric))
        .collect();
    match store.save_snapshots(&snapshot.stats) {
        Ok(()) => report.statistics.snapshots_saved = snapshot.stats.len(),
        Err(e) => report.record_error(&PipelineError::Persistence(e)),
    }
    info!(
        %as_of,
        history = history.len(),
        defined = snapshot.stats.len(),
        undefined = report.statistics.undefined.len(),
        "statistics computed"
    );

    // --- Clean ------------------------------------------------------------
    let cleaned = match clean_pending(store, &snapshot) {
        Ok(outcome) => outcome,
        Err(e) => {
            report.record_error(&PipelineError::Persistence(e));
            report.finish(now);
            return report;
        }
    };
    report.record_cleaning(&cleaned);

    // --- Summarize --------------------------------------------------------
    let summaries = summarize_days(store, &cleaned.touched_keys());
    report.record_summaries(&summaries);

    report.finish(now);
    report
}

/// Recomputes summaries for every stored (day, turbine), or only for `day`.
pub fn resummarize(store: &mut dyn Store, day: Option<NaiveDate>, now: DateTime<Utc>) -> RunReport {
    let mut report = RunReport::new(now);

    match all_summary_keys(store) {
        Ok(mut keys) => {
            if let Some(day) = day {
                keys.retain(|(d, _)| *d == day);
            }
            if keys.is_empty() {
                info!(day = ?day, "no clean or anomalous readings to summarize");
            }
            let summaries = summarize_days(store, &keys);
            report.record_summaries(&summaries);
        }
        Err(e) => report.record_error(&PipelineError::Persistence(e)),
    }

    report.finish(now);
    report
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::NoopHook;
    use crate::model::{ErrorKind, Reading};
    use crate::store::MemoryStore;
    use chrono::{Duration, TimeZone};
    use std::fs;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 5, 6, 0, 0).unwrap()
    }

    #[test]
    fn test_empty_source_dir_finishes_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let config = PipelineConfig {
            source_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let mut store = MemoryStore::new();

        let report = run(&mut store, &config, &NoopHook, fixed_now());
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.ingest.sources, 0);
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn test_single_row_history_holds_back_power_rows() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("data_group_1.csv"),
            "timestamp,turbine_id,wind_speed,wind_direction,power_output\n\
             2024-03-01 00:00:00,1,11.8,169,2.7\n",
        )
        .unwrap();
        let config = PipelineConfig {
            source_dir: dir.path().to_path_buf(),
            ..PipelineConfig::default()
        };
        let mut store = MemoryStore::new();

        let report = run(&mut store, &config, &NoopHook, fixed_now());
        assert_eq!(report.ingest.rows_inserted, 1);
        assert_eq!(report.cleaning.unresolved, 1, "one observation has no std dev");
        assert_eq!(report.count(ErrorKind::UndefinedStatistic), 1);
        assert!(store.clean_rows().is_empty());
        assert_eq!(report.exit_code(), 2);
    }

    #[test]
    fn test_resummarize_single_day() {
        let mut store = MemoryStore::new();
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let reading = |turbine_id: i32, hours: i64, power: f64| Reading {
            turbine_id,
            timestamp: base + Duration::hours(hours),
            wind_speed: Some(9.0),
            wind_direction: Some(180.0),
            power_output: Some(power),
        };
        store
            .write_cleaned(&[reading(1, 0, 1.0), reading(1, 1, 3.0), reading(1, 24, 5.0)], &[])
            .unwrap();

        let day = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let report = resummarize(&mut store, Some(day), fixed_now());
        assert_eq!(report.summaries.keys, 1);
        assert_eq!(report.summaries.summaries_written, 1);
        assert_eq!(store.daily_summaries()[0].avg, 2.0);
    }
}
