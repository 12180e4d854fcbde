/// Cross-source consistency checks.
///
/// Every export should cover roughly the same time range. When one source's
/// cursor trails the newest cursor by more than the configured lag, its
/// export is probably stale or stuck upstream. Such sources are reported, not
/// failed: the newest timestamp across sources is not treated as
/// authoritative for the lagging one.
///
/// Lag is strictly greater than the threshold:
///   lag > max_lag  →  lagging
///   lag == max_lag →  not lagging

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::model::IngestionCursor;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceLag {
    pub source_id: String,
    pub last_timestamp: DateTime<Utc>,
    pub newest_timestamp: DateTime<Utc>,
    pub lag_minutes: i64,
}

/// Sources whose `last_timestamp` trails the newest cursor by more than
/// `max_lag`, sorted by source id.
pub fn lagging_sources(cursors: &[IngestionCursor], max_lag: Duration) -> Vec<SourceLag> {
    let Some(newest) = cursors.iter().map(|c| c.last_timestamp).max() else {
        return Vec::new();
    };

    let mut lagging: Vec<SourceLag> = cursors
        .iter()
        .filter(|c| newest - c.last_timestamp > max_lag)
        .map(|c| SourceLag {
            source_id: c.source_id.clone(),
            last_timestamp: c.last_timestamp,
            newest_timestamp: newest,
            lag_minutes: (newest - c.last_timestamp).num_minutes(),
        })
        .collect();
    lagging.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    lagging
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
