//! WAL reader for recovery

use super::{list_segments, WalRecord};
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Counters collected while replaying
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub segments: usize,
    pub records: usize,
    pub corrupt_segments: usize,
}

/// Sequential reader over all WAL segments
pub struct WalReader {
    dir: PathBuf,
}

impl WalReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Feed every readable record, oldest segment first, to `apply`.
    ///
    /// A torn record at the end of a segment ends that segment silently.
    /// A checksum failure ends that segment with a warning; later segments
    /// are still read.
    pub fn replay<F>(&self, mut apply: F) -> Result<ReplayStats>
    where
        F: FnMut(WalRecord) -> Result<()>,
    {
        let mut stats = ReplayStats::default();
        for (id, path) in list_segments(&self.dir)? {
            stats.segments += 1;
            let data = fs::read(&path)?;
            let mut offset = 0;
            let mut count = 0;
            while offset < data.len() {
                match WalRecord::decode(&data[offset..]) {
                    Ok(Some((record, used))) => {
                        apply(record)?;
                        offset += used;
                        count += 1;
                    }
                    Ok(None) => {
                        warn!("Torn record at offset {} in WAL segment {}, ignoring tail", offset, id);
                        break;
                    }
                    Err(e @ (Error::ChecksumMismatch { .. } | Error::Corruption(_))) => {
                        warn!("{} at offset {} in WAL segment {}, skipping rest of segment", e, offset, id);
                        stats.corrupt_segments += 1;
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
            if count > 0 {
                info!("Replayed {} records from {:?}", count, path);
            }
            stats.records += count;
        }
        Ok(stats)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
