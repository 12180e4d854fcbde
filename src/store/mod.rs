//! Persistence layer.
//!
//! Every stage talks to storage through the `Store` trait so the pipeline can
//! run against PostgreSQL in production and against `MemoryStore` in tests
//! and dry runs. All calls are blocking.
//!
//! Stores hold four datasets keyed by `(turbine_id, timestamp)`:
//! - raw readings, append-only, duplicates ignored
//! - clean readings, every numeric field present
//! - anomalies, raw rows verbatim
//! - statistics snapshots, appended per run
//!
//! plus per-source ingestion cursors and the daily summary tables, which are
//! upserted by `(day, turbine_id)`.

pub mod memory;
pub mod pg;

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::model::{DailyAnomalyCount, DailySummary, IngestionCursor, Reading, StatSnapshot};

pub use memory::MemoryStore;
pub use pg::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Postgres(#[from] postgres::Error),

    #[error("missing required schema(s): {0}")]
    MissingSchema(String),

    /// The store refused the write. `MemoryStore` uses this for injected
    /// failures.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// A stored value could not be mapped back onto the model.
    #[error("malformed stored value: {0}")]
    Decode(String),
}

/// Rows written by one `write_cleaned` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanedWrite {
    pub clean: usize,
    pub anomalies: usize,
}

pub trait Store {
    // --- Ingestion --------------------------------------------------------

    fn load_cursor(&mut self, source_id: &str) -> Result<Option<IngestionCursor>, StoreError>;

    fn load_cursors(&mut self) -> Result<Vec<IngestionCursor>, StoreError>;

    /// Inserts `readings` into the raw store, ignoring keys already present,
    /// and moves the source's cursor to `cursor` in the same transaction.
    /// The cursor never moves backwards. Returns the number of new raw rows.
    fn commit_raw_batch(
        &mut self,
        readings: &[Reading],
        cursor: &IngestionCursor,
    ) -> Result<usize, StoreError>;

    // --- Statistics -------------------------------------------------------

    /// Newest timestamp in the raw store.
    fn latest_raw_timestamp(&mut self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Raw readings that have not been classified as anomalies.
    fn statistics_history(&mut self) -> Result<Vec<Reading>, StoreError>;

    fn save_snapshots(&mut self, snapshots: &[StatSnapshot]) -> Result<(), StoreError>;

    /// Snapshots of the most recent run, empty if none was ever saved.
    fn latest_snapshots(&mut self) -> Result<Vec<StatSnapshot>, StoreError>;

    // --- Cleaning ---------------------------------------------------------

    /// Raw readings present in neither the clean nor the anomaly store.
    fn pending_raw(&mut self) -> Result<Vec<Reading>, StoreError>;

    /// Writes both cleaning outputs atomically. A key already present in the
    /// other store is skipped, so a reading lands in at most one of them.
    fn write_cleaned(
        &mut self,
        clean: &[Reading],
        anomalies: &[Reading],
    ) -> Result<CleanedWrite, StoreError>;

    // --- Summaries --------------------------------------------------------

    /// Power output of every clean reading of `turbine_id` on UTC `day`.
    fn clean_power_output(&mut self, day: NaiveDate, turbine_id: i32) -> Result<Vec<f64>, StoreError>;

    fn count_anomalies(&mut self, day: NaiveDate, turbine_id: i32) -> Result<i64, StoreError>;

    /// Every (day, turbine) with at least one clean or anomalous reading.
    fn summary_keys(&mut self) -> Result<BTreeSet<(NaiveDate, i32)>, StoreError>;

    fn upsert_daily_summary(&mut self, summary: &DailySummary) -> Result<(), StoreError>;

    fn upsert_anomaly_count(&mut self, count: &DailyAnomalyCount) -> Result<(), StoreError>;
}
