/// End-to-end pipeline runs over temporary CSV exports and `MemoryStore`.
///
/// Covers the properties a daily re-run relies on:
/// 1. Ingesting an unchanged export twice adds nothing.
/// 2. Appended rows are picked up from the cursor onwards.
/// 3. Every raw reading is clean, anomalous or held back, never two of them.
/// 4. A failed raw write leaves cursors alone and the next run catches up.
/// 5. Out-of-order exports are flagged without stopping other sources.
/// 6. A repeated (turbine, timestamp) key in an export is flagged, not dropped.
///
/// Run with: cargo test --test pipeline_integration

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};

use turbine_service::archive::NoopHook;
use turbine_service::config::PipelineConfig;
use turbine_service::model::{ErrorKind, Reading};
use turbine_service::pipeline;
use turbine_service::sources::SourceDeclaration;
use turbine_service::store::{MemoryStore, Store};

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

const HEADER: &str = "timestamp,turbine_id,wind_speed,wind_direction,power_output\n";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
}

fn fixed_now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 2, 6, 0, 0).unwrap()
}

fn line(minutes: i64, turbine_id: i32, power: Option<f64>) -> String {
    let ts = (t0() + Duration::minutes(minutes)).format("%Y-%m-%d %H:%M:%S");
    let power = power.map(|p| p.to_string()).unwrap_or_default();
    format!("{},{},10.5,180,{}\n", ts, turbine_id, power)
}

/// 20 rows alternating 2.0/3.0, one 50.0 outlier, one row without power.
fn day_of_readings(turbine_id: i32) -> String {
    let mut body = String::new();
    for i in 0..20 {
        let power = if i % 2 == 0 { 2.0 } else { 3.0 };
        body.push_str(&line(i * 10, turbine_id, Some(power)));
    }
    body.push_str(&line(200, turbine_id, Some(50.0)));
    body.push_str(&line(210, turbine_id, None));
    body
}

fn write_source(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), format!("{}{}", HEADER, body)).unwrap();
}

fn append(dir: &Path, name: &str, body: &str) {
    let mut f = OpenOptions::new().append(true).open(dir.join(name)).unwrap();
    f.write_all(body.as_bytes()).unwrap();
}

fn config_for(dir: &Path) -> PipelineConfig {
    PipelineConfig {
        source_dir: dir.to_path_buf(),
        sources: vec![
            SourceDeclaration {
                id: "data_group_1.csv".to_string(),
                turbines: vec![1, 2, 3, 4, 5],
                description: None,
            },
            SourceDeclaration {
                id: "data_group_2.csv".to_string(),
                turbines: vec![6, 7, 8, 9, 10],
                description: None,
            },
        ],
        ..PipelineConfig::default()
    }
}

fn two_sources() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    write_source(dir.path(), "data_group_1.csv", &day_of_readings(1));
    write_source(dir.path(), "data_group_2.csv", &day_of_readings(6));
    dir
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
}

// ---------------------------------------------------------------------------
// Full Runs
// ---------------------------------------------------------------------------

#[test]
fn test_first_run_partitions_every_reading() {
    let dir = two_sources();
    let mut store = MemoryStore::new();

    let report = pipeline::run(&mut store, &config_for(dir.path()), &NoopHook, fixed_now());

    assert_eq!(report.exit_code(), 0, "unexpected errors: {:?}", report.errors);
    assert_eq!(report.ingest.rows_inserted, 44);
    assert_eq!(report.cleaning.pending, 44);
    assert_eq!(report.cleaning.anomalies, 2);
    assert_eq!(report.cleaning.clean, 42);
    assert_eq!(report.cleaning.unresolved, 0);
    assert_eq!(report.cleaning.imputed_fields, 2);

    let clean = store.clean_rows();
    let anomalies = store.anomaly_rows();
    assert_eq!(clean.len() + anomalies.len(), store.raw_rows().len());
    assert!(clean.iter().all(Reading::is_complete));
    assert!(anomalies.iter().all(|r| r.power_output == Some(50.0)));
    for a in &anomalies {
        assert!(!clean.iter().any(|c| c.key() == a.key()));
    }
}

#[test]
fn test_summaries_and_anomaly_counts_after_run() {
    let dir = two_sources();
    let mut store = MemoryStore::new();
    pipeline::run(&mut store, &config_for(dir.path()), &NoopHook, fixed_now());

    let summaries = store.daily_summaries();
    assert_eq!(summaries.len(), 2);
    for s in &summaries {
        assert_eq!(s.day, day());
        assert_eq!(s.min, 2.0);
        assert_eq!(s.max, 3.0, "imputed median stays within the observed range");
        assert!(s.avg > 2.0 && s.avg < 3.0);
    }

    let counts = store.anomaly_counts();
    assert_eq!(counts.len(), 2);
    assert!(counts.iter().all(|c| c.count == 1));
}

#[test]
fn test_second_run_on_unchanged_sources_is_idempotent() {
    let dir = two_sources();
    let config = config_for(dir.path());
    let mut store = MemoryStore::new();

    pipeline::run(&mut store, &config, &NoopHook, fixed_now());
    let cursors_before = store.load_cursors().unwrap();
    let summaries_before = store.daily_summaries();

    let second = pipeline::run(&mut store, &config, &NoopHook, fixed_now() + Duration::days(1));
    assert_eq!(second.exit_code(), 0);
    assert_eq!(second.ingest.rows_inserted, 0);
    assert_eq!(second.ingest.rows_examined, 0);
    assert_eq!(second.cleaning.pending, 0);
    assert_eq!(store.load_cursors().unwrap(), cursors_before);
    assert_eq!(store.raw_rows().len(), 44);
    assert_eq!(store.daily_summaries(), summaries_before);
}

#[test]
fn test_appended_rows_are_ingested_from_the_cursor() {
    let dir = two_sources();
    let config = config_for(dir.path());
    let mut store = MemoryStore::new();
    pipeline::run(&mut store, &config, &NoopHook, fixed_now());

    append(
        dir.path(),
        "data_group_1.csv",
        &format!("{}{}", line(220, 1, Some(2.5)), line(230, 2, Some(2.6))),
    );
    let report = pipeline::run(&mut store, &config, &NoopHook, fixed_now());

    assert_eq!(report.ingest.rows_inserted, 2);
    assert_eq!(report.cleaning.clean, 2);
    let cursor = store.load_cursor("data_group_1.csv").unwrap().unwrap();
    assert_eq!(cursor.last_row_index, 24);
    assert_eq!(cursor.last_timestamp, t0() + Duration::minutes(230));
    assert_eq!(store.daily_summaries().len(), 3, "turbine 2 now has a summary");
}

// ---------------------------------------------------------------------------
// Failure Isolation
// ---------------------------------------------------------------------------

#[test]
fn test_failed_raw_write_is_retried_on_next_run() {
    let dir = two_sources();
    let config = config_for(dir.path());
    let mut store = MemoryStore::new();

    store.fail_raw_writes_for("data_group_1.csv");
    store.fail_raw_writes_for("data_group_2.csv");
    let failed = pipeline::run(&mut store, &config, &NoopHook, fixed_now());
    assert_eq!(failed.exit_code(), 2);
    assert_eq!(failed.count(ErrorKind::Persistence), 2);
    assert!(store.load_cursors().unwrap().is_empty());
    assert!(store.raw_rows().is_empty());

    store.clear_raw_write_failures();
    let retried = pipeline::run(&mut store, &config, &NoopHook, fixed_now());
    assert_eq!(retried.exit_code(), 0);
    assert_eq!(retried.ingest.rows_inserted, 44);
}

#[test]
fn test_failed_raw_write_for_one_source_leaves_the_other_committed() {
    let dir = two_sources();
    let config = config_for(dir.path());
    let mut store = MemoryStore::new();

    store.fail_raw_writes_for("data_group_1.csv");
    let report = pipeline::run(&mut store, &config, &NoopHook, fixed_now());
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.count(ErrorKind::Persistence), 1);
    assert_eq!(report.ingest.rows_inserted, 22);
    assert_eq!(report.ingest.sources_failed, 1);

    assert!(store.load_cursor("data_group_1.csv").unwrap().is_none());
    let committed = store.load_cursor("data_group_2.csv").unwrap().unwrap();
    assert_eq!(committed.last_row_index, 22);
    assert!(store.raw_rows().iter().all(|r| r.turbine_id == 6));

    store.clear_raw_write_failures();
    let retried = pipeline::run(&mut store, &config, &NoopHook, fixed_now());
    assert_eq!(retried.ingest.rows_inserted, 22);
    assert_eq!(store.load_cursor("data_group_1.csv").unwrap().unwrap().last_row_index, 22);
    assert_eq!(store.raw_rows().len(), 44);
}

#[test]
fn test_repeated_key_in_export_is_flagged_and_first_row_kept() {
    let dir = two_sources();
    // Same turbine and timestamp as the last power reading, different value.
    append(dir.path(), "data_group_1.csv", &line(210, 1, Some(2.5)));
    let mut store = MemoryStore::new();

    let report = pipeline::run(&mut store, &config_for(dir.path()), &NoopHook, fixed_now());
    assert_eq!(report.count(ErrorKind::Integrity), 1);
    assert_eq!(report.ingest.sources_needing_review, vec!["data_group_1.csv".to_string()]);
    assert_eq!(report.ingest.rows_inserted, 44);
    assert_eq!(report.ingest.rows_examined, 45);
    assert_eq!(report.ingest.duplicates_ignored, 0);

    let kept: Vec<_> = store
        .raw_rows()
        .into_iter()
        .filter(|r| r.turbine_id == 1 && r.timestamp == t0() + Duration::minutes(210))
        .collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0].power_output, None, "first occurrence wins");
}

#[test]
fn test_out_of_order_source_is_flagged_and_others_continue() {
    let dir = two_sources();
    let config = config_for(dir.path());
    let mut store = MemoryStore::new();
    pipeline::run(&mut store, &config, &NoopHook, fixed_now());

    // Older than the cursor of group 2.
    append(dir.path(), "data_group_2.csv", &line(5, 6, Some(2.2)));
    append(dir.path(), "data_group_1.csv", &line(240, 1, Some(2.4)));
    let report = pipeline::run(&mut store, &config, &NoopHook, fixed_now());

    assert_eq!(report.count(ErrorKind::OutOfOrderData), 1);
    assert_eq!(report.ingest.sources_needing_review, vec!["data_group_2.csv".to_string()]);
    assert_eq!(report.ingest.rows_inserted, 1);
    assert_eq!(report.exit_code(), 2);

    // Reported once: the cursor moved past the bad row.
    let again = pipeline::run(&mut store, &config, &NoopHook, fixed_now());
    assert_eq!(again.count(ErrorKind::OutOfOrderData), 0);
}

#[test]
fn test_undeclared_turbine_is_not_ingested() {
    let dir = two_sources();
    append(dir.path(), "data_group_1.csv", &line(220, 7, Some(2.5)));
    let mut store = MemoryStore::new();

    let report = pipeline::run(&mut store, &config_for(dir.path()), &NoopHook, fixed_now());
    assert_eq!(report.count(ErrorKind::Integrity), 1);
    assert!(store.raw_rows().iter().all(|r| r.turbine_id != 7 || r.timestamp != t0() + Duration::minutes(220)));
}

#[test]
fn test_lagging_source_is_reported() {
    let dir = two_sources();
    let mut config = config_for(dir.path());
    config.max_source_lag_hours = 1;
    // Group 1 moves two hours past group 2.
    append(dir.path(), "data_group_1.csv", &line(210 + 121, 1, Some(2.5)));
    let mut store = MemoryStore::new();

    let report = pipeline::run(&mut store, &config, &NoopHook, fixed_now());
    assert_eq!(report.lagging_sources.len(), 1);
    assert_eq!(report.lagging_sources[0].source_id, "data_group_2.csv");
    assert_eq!(report.exit_code(), 0, "lag is reported, not failed");
}

#[test]
fn test_resummarize_rebuilds_from_stored_rows() {
    let dir = two_sources();
    let mut store = MemoryStore::new();
    pipeline::run(&mut store, &config_for(dir.path()), &NoopHook, fixed_now());
    let before = store.daily_summaries();

    let report = pipeline::resummarize(&mut store, None, fixed_now());
    assert_eq!(report.summaries.keys, 2);
    assert_eq!(report.exit_code(), 0);
    assert_eq!(store.daily_summaries(), before);
}
