//! Descriptive statistics over rolling windows.
//!
//! Shared by the cleaner (imputation medians, outlier bounds) and the
//! operator-facing statistics snapshots.
//!
//! # Clock injection
//! Every window is anchored on an explicit `as_of` instant rather than
//! `Utc::now()`. The pipeline passes the newest raw timestamp so that
//! replaying a historical export behaves the same as a live run, and tests
//! stay deterministic.
//!
//! # Conventions
//! - Absent values are skipped per metric; they never count as zero.
//! - A window with no observations is `StatsError::Undefined`, never a
//!   default of zero. Callers fall back to a broader window.
//! - Standard deviation is the **sample** standard deviation (n − 1). It is
//!   undefined below two observations.
//! - Mode is best effort: most frequent value, ties broken by the smallest
//!   value. Continuous measurements are mostly unique, so nothing load-bearing
//!   depends on it.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::WindowConfig;
use crate::model::{Metric, Period, Reading, StatSnapshot};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsError {
    #[error("no observations of {metric} in the {period} window")]
    Undefined { period: Period, metric: Metric },

    #[error("{metric} over {period}: need {needed} observations, have {available}")]
    InsufficientData {
        period: Period,
        metric: Metric,
        needed: usize,
        available: usize,
    },
}

// ---------------------------------------------------------------------------
// Scalar statistics
// ---------------------------------------------------------------------------

/// Statistics of one metric over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricStats {
    pub mean: f64,
    pub median: f64,
    pub mode: f64,
    pub std_dev: Option<f64>,
    pub observations: usize,
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Middle value of the sorted values; the average of the two middle values
/// for an even count.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let sorted = sorted(values);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Most frequent value; ties go to the smallest value.
pub fn mode(values: &[f64]) -> Option<f64> {
    let sorted = sorted(values);
    let mut best: Option<(f64, usize)> = None;
    let mut i = 0;
    while i < sorted.len() {
        let value = sorted[i];
        let mut j = i + 1;
        while j < sorted.len() && sorted[j].total_cmp(&value) == Ordering::Equal {
            j += 1;
        }
        let run = j - i;
        // Ascending order: only a strictly longer run displaces the current
        // best, so equal counts keep the smaller value.
        if best.is_none_or(|(_, count)| run > count) {
            best = Some((value, run));
        }
        i = j;
    }
    best.map(|(value, _)| value)
}

/// Sample standard deviation (n − 1 denominator). `None` below two values.
pub fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let sum_sq: f64 = values.iter().map(|v| (v - m).powi(2)).sum();
    Some((sum_sq / (values.len() - 1) as f64).sqrt())
}

/// All statistics at once; `None` for an empty slice.
pub fn describe(values: &[f64]) -> Option<MetricStats> {
    Some(MetricStats {
        mean: mean(values)?,
        median: median(values)?,
        mode: mode(values)?,
        std_dev: sample_std_dev(values),
        observations: values.len(),
    })
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted
}

// ---------------------------------------------------------------------------
// Windows
// ---------------------------------------------------------------------------

/// First instant inside the window, `None` for full history.
pub fn window_start(
    period: Period,
    as_of: DateTime<Utc>,
    windows: &WindowConfig,
) -> Option<DateTime<Utc>> {
    windows.length(period).map(|len| as_of - len)
}

/// Non-absent values of `metric` with `start <= timestamp <= as_of`.
pub fn values_in_window(
    dataset: &[Reading],
    period: Period,
    metric: Metric,
    as_of: DateTime<Utc>,
    windows: &WindowConfig,
) -> Vec<f64> {
    let start = window_start(period, as_of, windows);
    dataset
        .iter()
        .filter(|r| r.timestamp <= as_of)
        .filter(|r| start.is_none_or(|s| r.timestamp >= s))
        .filter_map(|r| metric.value_of(r))
        .collect()
}

/// Mean, median and mode (plus sample standard deviation) of `metric` over
/// `period` ending at `as_of`.
pub fn compute_stats(
    dataset: &[Reading],
    period: Period,
    metric: Metric,
    as_of: DateTime<Utc>,
    windows: &WindowConfig,
) -> Result<MetricStats, StatsError> {
    let values = values_in_window(dataset, period, metric, as_of, windows);
    describe(&values).ok_or(StatsError::Undefined { period, metric })
}

// ---------------------------------------------------------------------------
// Outlier bounds
// ---------------------------------------------------------------------------

/// Closed interval `[mean - sigma·sd, mean + sigma·sd]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutlierBounds {
    pub lower: f64,
    pub upper: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub sigma: f64,
}

impl OutlierBounds {
    pub fn new(mean: f64, std_dev: f64, sigma: f64) -> Self {
        Self {
            lower: mean - sigma * std_dev,
            upper: mean + sigma * std_dev,
            mean,
            std_dev,
            sigma,
        }
    }

    /// Inclusive on both ends: a value exactly on a bound is normal.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }

    /// A history without spread gives no usable interval; outlier detection
    /// is skipped for it.
    pub fn detects_outliers(&self) -> bool {
        self.std_dev > 0.0
    }
}

/// Outlier bounds of `metric` over full history.
pub fn compute_outlier_bounds(
    dataset: &[Reading],
    metric: Metric,
    as_of: DateTime<Utc>,
    sigma: f64,
) -> Result<OutlierBounds, StatsError> {
    let values = values_in_window(dataset, Period::Full, metric, as_of, &WindowConfig::default());
    bounds_from_values(&values, metric, sigma)
}

fn bounds_from_values(values: &[f64], metric: Metric, sigma: f64) -> Result<OutlierBounds, StatsError> {
    let m = mean(values).ok_or(StatsError::Undefined {
        period: Period::Full,
        metric,
    })?;
    let sd = sample_std_dev(values).ok_or(StatsError::InsufficientData {
        period: Period::Full,
        metric,
        needed: 2,
        available: values.len(),
    })?;
    Ok(OutlierBounds::new(m, sd, sigma))
}

// ---------------------------------------------------------------------------
// Snapshot used by the cleaner
// ---------------------------------------------------------------------------

/// Every defined (period, metric) statistic of one run plus the sigma used
/// for outlier bounds.
///
/// Bounds are derived from the full-history power output snapshot so the
/// persisted snapshots alone are enough to reproduce a run's classification.
#[derive(Debug, Clone, PartialEq)]
pub struct CleaningSnapshot {
    pub stats: Vec<StatSnapshot>,
    pub sigma: f64,
}

impl CleaningSnapshot {
    /// Compute every (period, metric) pair over `dataset`. Undefined pairs
    /// are simply absent from `stats`.
    pub fn build(
        dataset: &[Reading],
        as_of: DateTime<Utc>,
        windows: &WindowConfig,
        sigma: f64,
        computed_at: DateTime<Utc>,
    ) -> Self {
        let mut stats = Vec::new();
        for period in Period::ALL {
            for metric in Metric::ALL {
                if let Ok(s) = compute_stats(dataset, period, metric, as_of, windows) {
                    stats.push(StatSnapshot {
                        period,
                        metric,
                        mean: s.mean,
                        median: s.median,
                        mode: s.mode,
                        std_dev: s.std_dev,
                        observations: s.observations,
                        computed_at,
                    });
                }
            }
        }
        Self { stats, sigma }
    }

    pub fn from_snapshots(stats: Vec<StatSnapshot>, sigma: f64) -> Self {
        Self { stats, sigma }
    }

    pub fn stat(&self, period: Period, metric: Metric) -> Option<&StatSnapshot> {
        self.stats
            .iter()
            .find(|s| s.period == period && s.metric == metric)
    }

    /// (period, metric) pairs with no observations.
    pub fn undefined(&self) -> Vec<(Period, Metric)> {
        Period::ALL
            .into_iter()
            .flat_map(|p| Metric::ALL.into_iter().map(move |m| (p, m)))
            .filter(|(p, m)| self.stat(*p, *m).is_none())
            .collect()
    }

    /// Median of `metric` from the narrowest period that has one.
    pub fn median_with_fallback(&self, metric: Metric) -> Result<(Period, f64), StatsError> {
        Period::IMPUTATION_ORDER
            .into_iter()
            .find_map(|p| self.stat(p, metric).map(|s| (p, s.median)))
            .ok_or(StatsError::Undefined {
                period: Period::Full,
                metric,
            })
    }

    /// Power output anomaly bounds from the full-history snapshot.
    pub fn bounds(&self) -> Result<OutlierBounds, StatsError> {
        let metric = Metric::PowerOutput;
        let full = self.stat(Period::Full, metric).ok_or(StatsError::Undefined {
            period: Period::Full,
            metric,
        })?;
        let sd = full.std_dev.ok_or(StatsError::InsufficientData {
            period: Period::Full,
            metric,
            needed: 2,
            available: full.observations,
        })?;
        Ok(OutlierBounds::new(full.mean, sd, self.sigma))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
