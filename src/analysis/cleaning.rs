//! Outlier classification and missing-value imputation.
//!
//! Every pending raw reading ends up in exactly one place: the clean store,
//! the anomaly store, or the unresolved list (held back and retried on a
//! later run once enough history exists).

use std::collections::BTreeSet;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::analysis::statistics::{CleaningSnapshot, OutlierBounds, StatsError};
use crate::model::Reading;
use crate::store::{CleanedWrite, Store, StoreError};

/// Power output classification against the anomaly bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Normal,
    Anomaly,
}

/// A reading that could not be classified or imputed.
#[derive(Debug, Clone, PartialEq)]
pub struct UnresolvedReading {
    pub reading: Reading,
    pub reason: StatsError,
}

/// Partition of one cleaning pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CleanOutcome {
    pub clean: Vec<Reading>,
    pub anomalies: Vec<Reading>,
    pub unresolved: Vec<UnresolvedReading>,
    /// Number of individual fields filled in across `clean`.
    pub imputed_fields: usize,
    /// Rows the store actually accepted. Lower than `clean`/`anomalies` when
    /// another run cleaned some of the same readings first.
    pub written: CleanedWrite,
}

impl CleanOutcome {
    pub fn total(&self) -> usize {
        self.clean.len() + self.anomalies.len() + self.unresolved.len()
    }

    /// (day, turbine) keys whose clean or anomaly data changed.
    pub fn touched_keys(&self) -> BTreeSet<(NaiveDate, i32)> {
        self.clean
            .iter()
            .chain(self.anomalies.iter())
            .map(|r| (r.day(), r.turbine_id))
            .collect()
    }
}

/// Classifies a reading's power output.
///
/// A reading without power output cannot be an outlier and is `Normal` (its
/// power output is imputed later). Bounds are only needed when power output
/// is present. Bounds with zero spread flag nothing.
pub fn classify(
    reading: &Reading,
    bounds: &Result<OutlierBounds, StatsError>,
) -> Result<Classification, StatsError> {
    let Some(power) = reading.power_output else {
        return Ok(Classification::Normal);
    };
    let bounds = bounds.as_ref().map_err(Clone::clone)?;
    if !bounds.detects_outliers() || bounds.contains(power) {
        Ok(Classification::Normal)
    } else {
        Ok(Classification::Anomaly)
    }
}

/// Fills every absent field with the narrowest defined median.
///
/// Returns the completed reading and the number of fields filled.
pub fn impute(reading: &Reading, snapshot: &CleaningSnapshot) -> Result<(Reading, usize), StatsError> {
    let mut completed = reading.clone();
    let missing = reading.missing_metrics();
    for metric in &missing {
        let (_period, median) = snapshot.median_with_fallback(*metric)?;
        completed.set_metric(*metric, median);
    }
    Ok((completed, missing.len()))
}

/// Partitions `batch` into clean, anomalous and unresolved readings.
///
/// Deterministic for a given snapshot; performs no I/O.
pub fn clean(batch: &[Reading], snapshot: &CleaningSnapshot) -> CleanOutcome {
    let bounds = snapshot.bounds();
    if let Ok(b) = &bounds {
        if !b.detects_outliers() {
            warn!(mean = b.mean, "power output history has no spread; outlier detection skipped");
        }
    }
    let mut outcome = CleanOutcome::default();

    for reading in batch {
        let classification = match classify(reading, &bounds) {
            Ok(c) => c,
            Err(reason) => {
                outcome.unresolved.push(UnresolvedReading {
                    reading: reading.clone(),
                    reason,
                });
                continue;
            }
        };

        match classification {
            // Anomalies are kept verbatim, absent fields included.
            Classification::Anomaly => outcome.anomalies.push(reading.clone()),
            Classification::Normal => match impute(reading, snapshot) {
                Ok((completed, filled)) => {
                    outcome.imputed_fields += filled;
                    outcome.clean.push(completed);
                }
                Err(reason) => outcome.unresolved.push(UnresolvedReading {
                    reading: reading.clone(),
                    reason,
                }),
            },
        }
    }

    outcome
}

/// Cleans every raw reading not yet in the clean or anomaly store and writes
/// both outputs in one store call.
pub fn clean_pending(
    store: &mut dyn Store,
    snapshot: &CleaningSnapshot,
) -> Result<CleanOutcome, StoreError> {
    let pending = store.pending_raw()?;
    if pending.is_empty() {
        debug!("no pending raw readings to clean");
        return Ok(CleanOutcome::default());
    }

    let mut outcome = clean(&pending, snapshot);
    debug_assert_eq!(outcome.total(), pending.len());

    outcome.written = store.write_cleaned(&outcome.clean, &outcome.anomalies)?;

    let skipped = (outcome.clean.len() + outcome.anomalies.len())
        .saturating_sub(outcome.written.clean + outcome.written.anomalies);
    if skipped > 0 {
        warn!(skipped, "readings were already cleaned by another run");
    }

    info!(
        pending = pending.len(),
        clean = outcome.clean.len(),
        anomalies = outcome.anomalies.len(),
        clean_written = outcome.written.clean,
        anomalies_written = outcome.written.anomalies,
        unresolved = outcome.unresolved.len(),
        imputed_fields = outcome.imputed_fields,
        "cleaned pending readings"
    );
    for held in &outcome.unresolved {
        warn!(
            turbine_id = held.reading.turbine_id,
            timestamp = %held.reading.timestamp,
            reason = %held.reason,
            "reading held back until more history exists"
        );
    }

    Ok(outcome)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
