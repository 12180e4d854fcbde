//! Daily per-turbine aggregation.
//!
//! Power output min/max/avg over clean readings and anomaly counts, both
//! upserted by (day, turbine_id) so recomputing a day overwrites it.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::analysis::statistics::mean;
use crate::model::{DailyAnomalyCount, DailySummary, PipelineError};
use crate::store::{Store, StoreError};

/// Result of summarizing one (day, turbine) key.
#[derive(Debug, Clone, PartialEq)]
pub struct DaySummaryOutcome {
    /// `None` when the turbine has no clean readings that day.
    pub summary: Option<DailySummary>,
    pub anomalies: DailyAnomalyCount,
}

/// Totals for a set of keys.
#[derive(Debug, Default)]
pub struct SummaryRun {
    pub keys: usize,
    pub summaries_written: usize,
    pub counts_written: usize,
    pub errors: Vec<PipelineError>,
}

/// Min, max and average of `values`; `None` for an empty slice.
pub fn summarize_values(day: NaiveDate, turbine_id: i32, values: &[f64]) -> Option<DailySummary> {
    let avg = mean(values)?;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Some(DailySummary {
        day,
        turbine_id,
        min,
        max,
        avg,
    })
}

/// Recomputes and upserts the summary and anomaly count of one key.
pub fn summarize(
    store: &mut dyn Store,
    day: NaiveDate,
    turbine_id: i32,
) -> Result<DaySummaryOutcome, PipelineError> {
    let power = store.clean_power_output(day, turbine_id)?;
    let summary = summarize_values(day, turbine_id, &power);
    if let Some(s) = &summary {
        store.upsert_daily_summary(s)?;
    }

    let anomalies = DailyAnomalyCount {
        day,
        turbine_id,
        count: store.count_anomalies(day, turbine_id)?,
    };
    store.upsert_anomaly_count(&anomalies)?;

    Ok(DaySummaryOutcome { summary, anomalies })
}

/// Summarizes every key, isolating failures per key.
pub fn summarize_days(store: &mut dyn Store, keys: &BTreeSet<(NaiveDate, i32)>) -> SummaryRun {
    let mut run = SummaryRun {
        keys: keys.len(),
        ..SummaryRun::default()
    };

    for &(day, turbine_id) in keys {
        match summarize(store, day, turbine_id) {
            Ok(outcome) => {
                run.counts_written += 1;
                match outcome.summary {
                    Some(s) => {
                        debug!(%day, turbine_id, min = s.min, max = s.max, avg = s.avg, "daily summary upserted");
                        run.summaries_written += 1;
                    }
                    None => run.errors.push(PipelineError::StatisticsComputation {
                        day,
                        turbine_id,
                        message: "no clean power output readings".to_string(),
                    }),
                }
            }
            Err(e) => {
                warn!(%day, turbine_id, error = %e, "daily summary failed");
                run.errors.push(e);
            }
        }
    }

    run
}

/// Every (day, turbine) present in the clean or anomaly store.
pub fn all_summary_keys(store: &mut dyn Store) -> Result<BTreeSet<(NaiveDate, i32)>, StoreError> {
    store.summary_keys()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
