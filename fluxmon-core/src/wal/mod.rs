//! Write-Ahead Log (WAL) implementation
//!
//! Every new series definition, accepted sample and deletion is written
//! to the WAL before it is applied to the head block. On restart the
//! segments are replayed to rebuild the head. Segments are plain files
//! named `wal_{id:020}.log` with monotonically increasing ids.

mod reader;
mod record;
mod writer;

pub use reader::{ReplayStats, WalReader};
pub use record::{RecordType, SampleRecord, SeriesRecord, TombstoneRecord, WalRecord};
pub use writer::WalWriter;

use std::path::{Path, PathBuf};

/// WAL sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest)
    Immediate,
    /// Sync after N writes
    EveryN(usize),
    /// Sync when the last sync is older than the interval
    Interval { millis: u64 },
    /// Never sync (OS decides, fastest, least safe)
    None,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        SyncPolicy::Interval {
            millis: crate::config::WAL_SYNC_MILLIS,
        }
    }
}

/// WAL configuration
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory for WAL files
    pub dir: PathBuf,
    /// Sync policy
    pub sync_policy: SyncPolicy,
    /// Maximum segment size in bytes
    pub segment_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            sync_policy: SyncPolicy::default(),
            segment_size: crate::config::WAL_SEGMENT_SIZE,
        }
    }
}

pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("wal_{:020}.log", id))
}

pub(crate) fn parse_segment_id(path: &Path) -> Option<u64> {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|s| s.strip_prefix("wal_"))
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse().ok())
}

/// Segment ids and paths in the directory, ascending
pub(crate) fn list_segments(dir: &Path) -> crate::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = parse_segment_id(&path) {
            segments.push((id, path));
        }
    }
    segments.sort_by_key(|(id, _)| *id);
    Ok(segments)
}
