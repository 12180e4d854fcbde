/// PostgreSQL `Store` over the tables in `sql/001_base_schema.sql`.
///
/// Uses the blocking `postgres` client. Multi-row writes run in a single
/// transaction guarded by a transaction-scoped advisory lock, so overlapping
/// invocations of the daily job serialize instead of interleaving:
///
/// - raw writes lock on the source id
/// - cleaning writes lock on a fixed stage key
///
/// Raw, clean and anomaly inserts are `ON CONFLICT DO NOTHING`; summaries are
/// `ON CONFLICT (day, turbine_id) DO UPDATE`.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use postgres::{Client, NoTls, Row, Transaction};
use tracing::{debug, info};

use super::{CleanedWrite, Store, StoreError};
use crate::model::{
    DailyAnomalyCount, DailySummary, IngestionCursor, Metric, Period, Reading, StatSnapshot,
};

/// Schemas the service reads and writes.
pub const REQUIRED_SCHEMAS: [&str; 3] = ["turbine_raw", "turbine_clean", "turbine_stats"];

/// Advisory lock key shared by every cleaning write.
const CLEANING_LOCK_KEY: &str = "turbine_clean.write_cleaned";

pub struct PgStore {
    client: Client,
}

impl PgStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connects and fails fast when any of `schemas` is missing.
    pub fn connect_and_verify(url: &str, schemas: &[&str]) -> Result<Self, StoreError> {
        let mut client = Client::connect(url, NoTls)?;

        let wanted: Vec<String> = schemas.iter().map(|s| s.to_string()).collect();
        let rows = client.query(
            "SELECT schema_name::text FROM information_schema.schemata
             WHERE schema_name::text = ANY($1::text[])",
            &[&wanted],
        )?;
        let found: BTreeSet<String> = rows.iter().map(|r| r.get(0)).collect();
        let missing: Vec<&str> = schemas
            .iter()
            .copied()
            .filter(|s| !found.contains(*s))
            .collect();
        if !missing.is_empty() {
            return Err(StoreError::MissingSchema(format!(
                "{} (apply sql/001_base_schema.sql)",
                missing.join(", ")
            )));
        }

        info!(schemas = %schemas.join(","), "connected to PostgreSQL");
        Ok(Self::new(client))
    }

    pub fn client(&mut self) -> &mut Client {
        &mut self.client
    }
}

fn lock(tx: &mut Transaction<'_>, key: &str) -> Result<(), StoreError> {
    tx.execute("SELECT pg_advisory_xact_lock(hashtext($1)::bigint)", &[&key])?;
    Ok(())
}

fn reading_from_row(row: &Row) -> Reading {
    Reading {
        turbine_id: row.get("turbine_id"),
        timestamp: row.get("ts"),
        wind_speed: row.get("wind_speed"),
        wind_direction: row.get("wind_direction"),
        power_output: row.get("power_output"),
    }
}

fn cursor_from_row(row: &Row) -> Result<IngestionCursor, StoreError> {
    let last_row_index: i64 = row.get("last_row_index");
    Ok(IngestionCursor {
        source_id: row.get("source_id"),
        last_timestamp: row.get("last_timestamp"),
        last_row_index: u64::try_from(last_row_index).map_err(|_| {
            StoreError::Decode(format!("negative last_row_index {}", last_row_index))
        })?,
        updated_at: row.get("updated_at"),
    })
}

fn snapshot_from_row(row: &Row) -> Result<StatSnapshot, StoreError> {
    let period: String = row.get("period");
    let metric: String = row.get("metric");
    let observations: i64 = row.get("observations");
    Ok(StatSnapshot {
        period: period.parse::<Period>().map_err(StoreError::Decode)?,
        metric: metric.parse::<Metric>().map_err(StoreError::Decode)?,
        mean: row.get("mean"),
        median: row.get("median"),
        mode: row.get("mode"),
        std_dev: row.get("std_dev"),
        observations: usize::try_from(observations)
            .map_err(|_| StoreError::Decode(format!("negative observations {}", observations)))?,
        computed_at: row.get("computed_at"),
    })
}

const READING_COLUMNS: &str = "turbine_id, ts, wind_speed, wind_direction, power_output";

impl Store for PgStore {
    fn load_cursor(&mut self, source_id: &str) -> Result<Option<IngestionCursor>, StoreError> {
        let row = self.client.query_opt(
            "SELECT source_id, last_timestamp, last_row_index, updated_at
             FROM turbine_raw.ingestion_cursors
             WHERE source_id = $1",
            &[&source_id],
        )?;
        row.as_ref().map(cursor_from_row).transpose()
    }

    fn load_cursors(&mut self) -> Result<Vec<IngestionCursor>, StoreError> {
        let rows = self.client.query(
            "SELECT source_id, last_timestamp, last_row_index, updated_at
             FROM turbine_raw.ingestion_cursors
             ORDER BY source_id",
            &[],
        )?;
        rows.iter().map(cursor_from_row).collect()
    }

    fn commit_raw_batch(
        &mut self,
        readings: &[Reading],
        cursor: &IngestionCursor,
    ) -> Result<usize, StoreError> {
        let row_index = i64::try_from(cursor.last_row_index)
            .map_err(|_| StoreError::Rejected(format!("row index {} out of range", cursor.last_row_index)))?;

        let mut tx = self.client.transaction()?;
        lock(&mut tx, &cursor.source_id)?;

        let insert = tx.prepare(
            "INSERT INTO turbine_raw.readings
                (turbine_id, ts, wind_speed, wind_direction, power_output, source_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (turbine_id, ts) DO NOTHING",
        )?;
        let mut inserted = 0u64;
        for r in readings {
            inserted += tx.execute(
                &insert,
                &[
                    &r.turbine_id,
                    &r.timestamp,
                    &r.wind_speed,
                    &r.wind_direction,
                    &r.power_output,
                    &cursor.source_id,
                ],
            )?;
        }

        // Forward-only: a stale writer never rewinds a cursor.
        tx.execute(
            "INSERT INTO turbine_raw.ingestion_cursors
                (source_id, last_timestamp, last_row_index, updated_at)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (source_id) DO UPDATE SET
                last_timestamp = EXCLUDED.last_timestamp,
                last_row_index = EXCLUDED.last_row_index,
                updated_at = EXCLUDED.updated_at
             WHERE turbine_raw.ingestion_cursors.last_row_index <= EXCLUDED.last_row_index
               AND turbine_raw.ingestion_cursors.last_timestamp <= EXCLUDED.last_timestamp",
            &[
                &cursor.source_id,
                &cursor.last_timestamp,
                &row_index,
                &cursor.updated_at,
            ],
        )?;

        tx.commit()?;
        debug!(source = %cursor.source_id, inserted, row = cursor.last_row_index, "raw batch committed");
        Ok(inserted as usize)
    }

    fn latest_raw_timestamp(&mut self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = self
            .client
            .query_one("SELECT MAX(ts) FROM turbine_raw.readings", &[])?;
        Ok(row.get(0))
    }

    fn statistics_history(&mut self) -> Result<Vec<Reading>, StoreError> {
        let sql = format!(
            "SELECT {cols} FROM turbine_raw.readings r
             WHERE NOT EXISTS (
                SELECT 1 FROM turbine_clean.anomalies a
                WHERE a.turbine_id = r.turbine_id AND a.ts = r.ts)
             ORDER BY ts, turbine_id",
            cols = READING_COLUMNS
        );
        let rows = self.client.query(&sql, &[])?;
        Ok(rows.iter().map(reading_from_row).collect())
    }

    fn save_snapshots(&mut self, snapshots: &[StatSnapshot]) -> Result<(), StoreError> {
        let mut tx = self.client.transaction()?;
        let insert = tx.prepare(
            "INSERT INTO turbine_stats.snapshots
                (computed_at, period, metric, mean, median, mode, std_dev, observations)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (computed_at, period, metric) DO NOTHING",
        )?;
        for s in snapshots {
            let observations = s.observations as i64;
            tx.execute(
                &insert,
                &[
                    &s.computed_at,
                    &s.period.as_str(),
                    &s.metric.as_str(),
                    &s.mean,
                    &s.median,
                    &s.mode,
                    &s.std_dev,
                    &observations,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn latest_snapshots(&mut self) -> Result<Vec<StatSnapshot>, StoreError> {
        let rows = self.client.query(
            "SELECT computed_at, period, metric, mean, median, mode, std_dev, observations
             FROM turbine_stats.snapshots
             WHERE computed_at = (SELECT MAX(computed_at) FROM turbine_stats.snapshots)
             ORDER BY period, metric",
            &[],
        )?;
        rows.iter().map(snapshot_from_row).collect()
    }

    fn pending_raw(&mut self) -> Result<Vec<Reading>, StoreError> {
        let sql = format!(
            "SELECT {cols} FROM turbine_raw.readings r
             WHERE NOT EXISTS (
                SELECT 1 FROM turbine_clean.readings c
                WHERE c.turbine_id = r.turbine_id AND c.ts = r.ts)
               AND NOT EXISTS (
                SELECT 1 FROM turbine_clean.anomalies a
                WHERE a.turbine_id = r.turbine_id AND a.ts = r.ts)
             ORDER BY ts, turbine_id",
            cols = READING_COLUMNS
        );
        let rows = self.client.query(&sql, &[])?;
        Ok(rows.iter().map(reading_from_row).collect())
    }

    fn write_cleaned(
        &mut self,
        clean: &[Reading],
        anomalies: &[Reading],
    ) -> Result<CleanedWrite, StoreError> {
        let mut tx = self.client.transaction()?;
        lock(&mut tx, CLEANING_LOCK_KEY)?;

        let insert_clean = tx.prepare(
            "INSERT INTO turbine_clean.readings
                (turbine_id, ts, wind_speed, wind_direction, power_output)
             SELECT $1::integer, $2::timestamptz, $3::float8, $4::float8, $5::float8
             WHERE NOT EXISTS (
                SELECT 1 FROM turbine_clean.anomalies a
                WHERE a.turbine_id = $1::integer AND a.ts = $2::timestamptz)
             ON CONFLICT (turbine_id, ts) DO NOTHING",
        )?;
        let insert_anomaly = tx.prepare(
            "INSERT INTO turbine_clean.anomalies
                (turbine_id, ts, wind_speed, wind_direction, power_output)
             SELECT $1::integer, $2::timestamptz, $3::float8, $4::float8, $5::float8
             WHERE NOT EXISTS (
                SELECT 1 FROM turbine_clean.readings c
                WHERE c.turbine_id = $1::integer AND c.ts = $2::timestamptz)
             ON CONFLICT (turbine_id, ts) DO NOTHING",
        )?;

        let mut written = CleanedWrite::default();
        for r in clean {
            written.clean += tx.execute(
                &insert_clean,
                &[&r.turbine_id, &r.timestamp, &r.wind_speed, &r.wind_direction, &r.power_output],
            )? as usize;
        }
        for r in anomalies {
            written.anomalies += tx.execute(
                &insert_anomaly,
                &[&r.turbine_id, &r.timestamp, &r.wind_speed, &r.wind_direction, &r.power_output],
            )? as usize;
        }

        tx.commit()?;
        Ok(written)
    }

    fn clean_power_output(&mut self, day: NaiveDate, turbine_id: i32) -> Result<Vec<f64>, StoreError> {
        let rows = self.client.query(
            "SELECT power_output FROM turbine_clean.readings
             WHERE turbine_id = $1 AND (ts AT TIME ZONE 'UTC')::date = $2",
            &[&turbine_id, &day],
        )?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    fn count_anomalies(&mut self, day: NaiveDate, turbine_id: i32) -> Result<i64, StoreError> {
        let row = self.client.query_one(
            "SELECT COUNT(*) FROM turbine_clean.anomalies
             WHERE turbine_id = $1 AND (ts AT TIME ZONE 'UTC')::date = $2",
            &[&turbine_id, &day],
        )?;
        Ok(row.get(0))
    }

    fn summary_keys(&mut self) -> Result<BTreeSet<(NaiveDate, i32)>, StoreError> {
        let rows = self.client.query(
            "SELECT (ts AT TIME ZONE 'UTC')::date AS day, turbine_id FROM turbine_clean.readings
             UNION
             SELECT (ts AT TIME ZONE 'UTC')::date AS day, turbine_id FROM turbine_clean.anomalies",
            &[],
        )?;
        Ok(rows.iter().map(|r| (r.get(0), r.get(1))).collect())
    }

    fn upsert_daily_summary(&mut self, summary: &DailySummary) -> Result<(), StoreError> {
        self.client.execute(
            "INSERT INTO turbine_stats.daily_summaries
                (day, turbine_id, min_power, max_power, avg_power, updated_at)
             VALUES ($1, $2, $3, $4, $5, now())
             ON CONFLICT (day, turbine_id) DO UPDATE SET
                min_power = EXCLUDED.min_power,
                max_power = EXCLUDED.max_power,
                avg_power = EXCLUDED.avg_power,
                updated_at = EXCLUDED.updated_at",
            &[
                &summary.day,
                &summary.turbine_id,
                &summary.min,
                &summary.max,
                &summary.avg,
            ],
        )?;
        Ok(())
    }

    fn upsert_anomaly_count(&mut self, count: &DailyAnomalyCount) -> Result<(), StoreError> {
        self.client.execute(
            "INSERT INTO turbine_stats.daily_anomaly_counts
                (day, turbine_id, anomaly_count, updated_at)
             VALUES ($1, $2, $3, now())
             ON CONFLICT (day, turbine_id) DO UPDATE SET
                anomaly_count = EXCLUDED.anomaly_count,
                updated_at = EXCLUDED.updated_at",
            &[&count.day, &count.turbine_id, &count.count],
        )?;
        Ok(())
    }
}
