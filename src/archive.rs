/// Post-ingestion handling of fully consumed sources.
///
/// The hook fires only after a source's raw rows and cursor are committed and
/// the source raised no errors. `ArchiveMover` moves the export into the
/// archive directory under a `YYYYmmdd_HHMMSS_` prefix so repeated archives of
/// the same file name never collide.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::info;

use crate::ingest::csv_source::SourceFile;

pub trait ConsumedSourceHook {
    /// Returns where the source ended up, if it was moved.
    fn source_consumed(&self, source: &SourceFile, now: DateTime<Utc>) -> io::Result<Option<PathBuf>>;
}

/// Leaves consumed sources in place.
pub struct NoopHook;

impl ConsumedSourceHook for NoopHook {
    fn source_consumed(&self, _source: &SourceFile, _now: DateTime<Utc>) -> io::Result<Option<PathBuf>> {
        Ok(None)
    }
}

pub struct ArchiveMover {
    archive_dir: PathBuf,
}

impl ArchiveMover {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
        }
    }

    /// Destination of `source` when archived at `now`.
    pub fn archived_path(&self, source: &SourceFile, now: DateTime<Utc>) -> PathBuf {
        self.archive_dir
            .join(format!("{}_{}", now.format("%Y%m%d_%H%M%S"), source.id))
    }
}

impl ConsumedSourceHook for ArchiveMover {
    fn source_consumed(&self, source: &SourceFile, now: DateTime<Utc>) -> io::Result<Option<PathBuf>> {
        fs::create_dir_all(&self.archive_dir)?;
        let dest = self.archived_path(source, now);
        move_file(&source.path, &dest)?;
        info!(source = %source.id, dest = %dest.display(), "archived consumed source");
        Ok(Some(dest))
    }
}

/// `rename`, falling back to copy and delete across filesystems.
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
