//! Immutable on-disk blocks
//!
//! A block covers a half-open time range `[min_time, max_time)` and lives
//! in its own directory:
//!
//! ```text
//! blocks/0000001700000-0000001707200-1a2b3c4d/
//!     meta.json        block metadata
//!     index            series labels and chunk locations
//!     chunks/000001    framed chunk data
//!     tombstones.json  deletions (optional)
//! ```
//!
//! Blocks are written into a `.tmp` directory and renamed into place once
//! every file is synced, so a crash never leaves a half-written block
//! under its final name.

mod reader;
pub mod tombstones;
mod writer;

pub use reader::BlockReader;
pub use tombstones::{is_deleted, Interval, Tombstones};
pub use writer::BlockWriter;

use crate::{Labels, Result, Timestamp};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Magic bytes at the start of the index file
pub(crate) const INDEX_MAGIC: &[u8; 4] = b"FMIX";

/// Index format version
pub(crate) const INDEX_VERSION: u8 = 1;

/// Chunk entry flag: payload is LZ4 compressed
pub(crate) const CHUNK_FLAG_LZ4: u8 = 0x01;

pub(crate) const META_FILE: &str = "meta.json";
pub(crate) const INDEX_FILE: &str = "index";
pub(crate) const CHUNKS_DIR: &str = "chunks";
pub(crate) const TOMBSTONES_FILE: &str = "tombstones.json";
pub(crate) const TMP_SUFFIX: &str = ".tmp";

/// Directory holding blocks that failed to open
pub const QUARANTINE_DIR: &str = "quarantine";

/// Block metadata persisted as `meta.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Unique block id
    pub id: String,
    /// Inclusive lower bound
    pub min_time: Timestamp,
    /// Exclusive upper bound
    pub max_time: Timestamp,
    pub stats: BlockStats,
    pub compaction: CompactionMeta,
    pub version: u32,
}

impl BlockMeta {
    /// Directory name: zero-padded time range plus a short id
    pub fn dir_name(&self) -> String {
        let short: String = self.id.chars().filter(|c| *c != '-').take(8).collect();
        format!("{:013}-{:013}-{}", self.min_time, self.max_time, short)
    }

    pub fn overlaps(&self, mint: Timestamp, maxt: Timestamp) -> bool {
        self.min_time <= maxt && self.max_time > mint
    }

    pub fn range(&self) -> Timestamp {
        self.max_time - self.min_time
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let data = fs::read(dir.join(META_FILE))?;
        serde_json::from_slice(&data)
            .map_err(|e| crate::Error::Corruption(format!("invalid block meta in {:?}: {}", dir, e)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockStats {
    pub num_series: u64,
    pub num_samples: u64,
    pub num_chunks: u64,
}

/// Compaction lineage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompactionMeta {
    /// 1 for blocks cut from the head, +1 per compaction
    pub level: u32,
    /// Ids of the blocks this one was built from
    pub sources: Vec<String>,
}

/// Location of one chunk inside a block
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkMeta {
    pub min_t: Timestamp,
    pub max_t: Timestamp,
    /// Chunk segment file number
    pub file: u32,
    pub offset: u64,
    /// Length of the framed entry
    pub len: u32,
}

/// One series in the block index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub labels: Labels,
    pub chunks: Vec<ChunkMeta>,
}

pub(crate) fn chunk_file_path(block_dir: &Path, file: u32) -> PathBuf {
    block_dir.join(CHUNKS_DIR).join(format!("{:06}", file))
}

/// Sync a directory so renames and new entries inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    fs::File::open(dir)?.sync_all()?;
    Ok(())
}

/// Block directories under `blocks_dir`, skipping temporary and quarantined ones
pub fn list_block_dirs(blocks_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !blocks_dir.exists() {
        return Ok(dirs);
    }
    for entry in fs::read_dir(blocks_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name == QUARANTINE_DIR || name.starts_with('.') || name.ends_with(TMP_SUFFIX) {
            continue;
        }
        dirs.push(entry.path());
    }
    dirs.sort();
    Ok(dirs)
}

/// Remove leftovers of interrupted block writes
pub fn remove_tmp_dirs(blocks_dir: &Path) -> Result<usize> {
    let mut removed = 0;
    if !blocks_dir.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(blocks_dir)? {
        let path = entry?.path();
        let is_tmp = path
            .file_name()
            .map(|n| n.to_string_lossy().ends_with(TMP_SUFFIX))
            .unwrap_or(false);
        if is_tmp && path.is_dir() {
            fs::remove_dir_all(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Move a block directory aside so it is no longer loaded
pub fn quarantine(blocks_dir: &Path, block_dir: &Path) -> Result<PathBuf> {
    let target_dir = blocks_dir.join(QUARANTINE_DIR);
    fs::create_dir_all(&target_dir)?;
    let name = block_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let target = target_dir.join(name);
    fs::rename(block_dir, &target)?;
    sync_dir(blocks_dir)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_name() {
        let meta = BlockMeta {
            id: "1a2b3c4d-0000-0000-0000-000000000000".into(),
            min_time: 0,
            max_time: 7_200_000,
            stats: BlockStats::default(),
            compaction: CompactionMeta::default(),
            version: 1,
        };
        assert_eq!(meta.dir_name(), "0000000000000-0000007200000-1a2b3c4d");
        assert!(meta.overlaps(7_199_999, 8_000_000));
        assert!(!meta.overlaps(7_200_000, 8_000_000));
    }
}
