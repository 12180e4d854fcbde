/// In-memory `Store` used by tests and `--dry-run`.
///
/// Mirrors the PostgreSQL semantics: duplicate raw keys are ignored, cursors
/// only move forward, clean and anomaly stores are mutually exclusive, and
/// summaries are upserted. `fail_raw_writes_for` makes `commit_raw_batch`
/// fail for one source without touching any state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};

use super::{CleanedWrite, Store, StoreError};
use crate::model::{DailyAnomalyCount, DailySummary, IngestionCursor, Reading, StatSnapshot};

type ReadingKey = (i32, DateTime<Utc>);
type DayKey = (NaiveDate, i32);

#[derive(Debug, Default)]
pub struct MemoryStore {
    raw: BTreeMap<ReadingKey, Reading>,
    clean: BTreeMap<ReadingKey, Reading>,
    anomalies: BTreeMap<ReadingKey, Reading>,
    cursors: BTreeMap<String, IngestionCursor>,
    snapshots: Vec<StatSnapshot>,
    summaries: BTreeMap<DayKey, DailySummary>,
    anomaly_counts: BTreeMap<DayKey, DailyAnomalyCount>,
    fail_raw_writes_for: BTreeSet<String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every later `commit_raw_batch` for `source_id` return
    /// `StoreError::Rejected`. Other sources are unaffected.
    pub fn fail_raw_writes_for(&mut self, source_id: &str) {
        self.fail_raw_writes_for.insert(source_id.to_string());
    }

    pub fn clear_raw_write_failures(&mut self) {
        self.fail_raw_writes_for.clear();
    }

    /// Inserts raw rows directly, bypassing cursors.
    pub fn seed_raw(&mut self, readings: &[Reading]) {
        for r in readings {
            self.raw.entry(r.key()).or_insert_with(|| r.clone());
        }
    }

    pub fn raw_rows(&self) -> Vec<Reading> {
        self.raw.values().cloned().collect()
    }

    pub fn clean_rows(&self) -> Vec<Reading> {
        self.clean.values().cloned().collect()
    }

    pub fn anomaly_rows(&self) -> Vec<Reading> {
        self.anomalies.values().cloned().collect()
    }

    pub fn daily_summaries(&self) -> Vec<DailySummary> {
        self.summaries.values().cloned().collect()
    }

    pub fn anomaly_counts(&self) -> Vec<DailyAnomalyCount> {
        self.anomaly_counts.values().cloned().collect()
    }

    fn on_day(reading: &Reading, day: NaiveDate, turbine_id: i32) -> bool {
        reading.turbine_id == turbine_id && reading.day() == day
    }
}

impl Store for MemoryStore {
    fn load_cursor(&mut self, source_id: &str) -> Result<Option<IngestionCursor>, StoreError> {
        Ok(self.cursors.get(source_id).cloned())
    }

    fn load_cursors(&mut self) -> Result<Vec<IngestionCursor>, StoreError> {
        Ok(self.cursors.values().cloned().collect())
    }

    fn commit_raw_batch(
        &mut self,
        readings: &[Reading],
        cursor: &IngestionCursor,
    ) -> Result<usize, StoreError> {
        if self.fail_raw_writes_for.contains(&cursor.source_id) {
            return Err(StoreError::Rejected(format!(
                "raw writes disabled for {}",
                cursor.source_id
            )));
        }

        let mut inserted = 0;
        for r in readings {
            if !self.raw.contains_key(&r.key()) {
                self.raw.insert(r.key(), r.clone());
                inserted += 1;
            }
        }

        let advance = self
            .cursors
            .get(&cursor.source_id)
            .is_none_or(|current| cursor.is_at_or_after(current));
        if advance {
            self.cursors.insert(cursor.source_id.clone(), cursor.clone());
        }

        Ok(inserted)
    }

    fn latest_raw_timestamp(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.raw.values().map(|r| r.timestamp).max())
    }

    fn statistics_history(&mut self) -> Result<Vec<Reading>, StoreError> {
        Ok(self
            .raw
            .iter()
            .filter(|(k, _)| !self.anomalies.contains_key(*k))
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn save_snapshots(&mut self, snapshots: &[StatSnapshot]) -> Result<(), StoreError> {
        self.snapshots.extend_from_slice(snapshots);
        Ok(())
    }

    fn latest_snapshots(&mut self) -> Result<Vec<StatSnapshot>, StoreError> {
        let Some(latest) = self.snapshots.iter().map(|s| s.computed_at).max() else {
            return Ok(Vec::new());
        };
        Ok(self
            .snapshots
            .iter()
            .filter(|s| s.computed_at == latest)
            .cloned()
            .collect())
    }

    fn pending_raw(&mut self) -> Result<Vec<Reading>, StoreError> {
        Ok(self
            .raw
            .iter()
            .filter(|(k, _)| !self.clean.contains_key(*k) && !self.anomalies.contains_key(*k))
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn write_cleaned(
        &mut self,
        clean: &[Reading],
        anomalies: &[Reading],
    ) -> Result<CleanedWrite, StoreError> {
        let mut written = CleanedWrite::default();
        for r in clean {
            let key = r.key();
            if !self.clean.contains_key(&key) && !self.anomalies.contains_key(&key) {
                self.clean.insert(key, r.clone());
                written.clean += 1;
            }
        }
        for r in anomalies {
            let key = r.key();
            if !self.clean.contains_key(&key) && !self.anomalies.contains_key(&key) {
                self.anomalies.insert(key, r.clone());
                written.anomalies += 1;
            }
        }
        Ok(written)
    }

    fn clean_power_output(&mut self, day: NaiveDate, turbine_id: i32) -> Result<Vec<f64>, StoreError> {
        Ok(self
            .clean
            .values()
            .filter(|r| Self::on_day(r, day, turbine_id))
            .filter_map(|r| r.power_output)
            .collect())
    }

    fn count_anomalies(&mut self, day: NaiveDate, turbine_id: i32) -> Result<i64, StoreError> {
        let count = self
            .anomalies
            .values()
            .filter(|r| Self::on_day(r, day, turbine_id))
            .count();
        Ok(count as i64)
    }

    fn summary_keys(&mut self) -> Result<BTreeSet<(NaiveDate, i32)>, StoreError> {
        Ok(self
            .clean
            .values()
            .chain(self.anomalies.values())
            .map(|r| (r.day(), r.turbine_id))
            .collect())
    }

    fn upsert_daily_summary(&mut self, summary: &DailySummary) -> Result<(), StoreError> {
        self.summaries
            .insert((summary.day, summary.turbine_id), summary.clone());
        Ok(())
    }

    fn upsert_anomaly_count(&mut self, count: &DailyAnomalyCount) -> Result<(), StoreError> {
        self.anomaly_counts
            .insert((count.day, count.turbine_id), count.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Metric, Period};
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn reading(turbine_id: i32, minutes: i64, power: Option<f64>) -> Reading {
        Reading {
            turbine_id,
            timestamp: t0() + Duration::minutes(minutes),
            wind_speed: Some(7.0),
            wind_direction: Some(190.0),
            power_output: power,
        }
    }

    fn cursor(row: u64, minutes: i64) -> IngestionCursor {
        IngestionCursor {
            source_id: "data_group_1.csv".to_string(),
            last_timestamp: t0() + Duration::minutes(minutes),
            last_row_index: row,
            updated_at: t0(),
        }
    }

    #[test]
    fn test_duplicate_raw_keys_are_ignored() {
        let mut store = MemoryStore::new();
        let batch = vec![reading(1, 0, Some(2.0)), reading(1, 10, Some(2.1))];
        assert_eq!(store.commit_raw_batch(&batch, &cursor(2, 10)).unwrap(), 2);

        let mut altered = batch.clone();
        altered[0].power_output = Some(99.0);
        assert_eq!(store.commit_raw_batch(&altered, &cursor(2, 10)).unwrap(), 0);
        assert_eq!(store.raw_rows()[0].power_output, Some(2.0), "raw rows are immutable");
    }

    #[test]
    fn test_cursor_never_moves_backwards() {
        let mut store = MemoryStore::new();
        store.commit_raw_batch(&[], &cursor(10, 50)).unwrap();
        store.commit_raw_batch(&[], &cursor(4, 20)).unwrap();
        let current = store.load_cursor("data_group_1.csv").unwrap().unwrap();
        assert_eq!(current.last_row_index, 10);
    }

    #[test]
    fn test_failed_raw_write_changes_nothing() {
        let mut store = MemoryStore::new();
        store.fail_raw_writes_for("data_group_1.csv");
        let result = store.commit_raw_batch(&[reading(1, 0, Some(2.0))], &cursor(1, 0));
        assert!(matches!(result, Err(StoreError::Rejected(_))));
        assert!(store.raw_rows().is_empty());
        assert!(store.load_cursor("data_group_1.csv").unwrap().is_none());
    }

    #[test]
    fn test_raw_write_failure_is_scoped_to_one_source() {
        let mut store = MemoryStore::new();
        store.fail_raw_writes_for("data_group_1.csv");

        let mut other = cursor(1, 0);
        other.source_id = "data_group_2.csv".to_string();
        assert_eq!(store.commit_raw_batch(&[reading(6, 0, Some(2.0))], &other).unwrap(), 1);
        assert!(store.commit_raw_batch(&[reading(1, 0, Some(2.0))], &cursor(1, 0)).is_err());

        store.clear_raw_write_failures();
        assert_eq!(store.commit_raw_batch(&[reading(1, 0, Some(2.0))], &cursor(1, 0)).unwrap(), 1);
    }

    #[test]
    fn test_clean_and_anomaly_stores_are_exclusive() {
        let mut store = MemoryStore::new();
        let r = reading(2, 0, Some(3.0));
        store.seed_raw(&[r.clone()]);

        let first = store.write_cleaned(&[], &[r.clone()]).unwrap();
        let second = store.write_cleaned(&[r.clone()], &[]).unwrap();
        assert_eq!(first, CleanedWrite { clean: 0, anomalies: 1 });
        assert_eq!(second, CleanedWrite::default());
        assert!(store.pending_raw().unwrap().is_empty());
        assert!(store.statistics_history().unwrap().is_empty(), "anomalies are excluded");
    }

    #[test]
    fn test_latest_snapshots_returns_only_newest_run() {
        let mut store = MemoryStore::new();
        let snap = |at: DateTime<Utc>, mean: f64| StatSnapshot {
            period: Period::Full,
            metric: Metric::PowerOutput,
            mean,
            median: mean,
            mode: mean,
            std_dev: None,
            observations: 1,
            computed_at: at,
        };
        assert!(store.latest_snapshots().unwrap().is_empty());
        store.save_snapshots(&[snap(t0(), 1.0)]).unwrap();
        store
            .save_snapshots(&[snap(t0() + Duration::days(1), 2.0)])
            .unwrap();

        let latest = store.latest_snapshots().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].mean, 2.0);
    }

    #[test]
    fn test_summary_keys_span_clean_and_anomalies() {
        let mut store = MemoryStore::new();
        store
            .write_cleaned(&[reading(1, 0, Some(1.0))], &[reading(2, 60 * 30, Some(9.0))])
            .unwrap();
        let keys: Vec<_> = store.summary_keys().unwrap().into_iter().collect();
        assert_eq!(
            keys,
            vec![
                (NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), 1),
                (NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(), 2),
            ]
        );
    }
}
