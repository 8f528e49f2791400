//! Block compaction
//!
//! Blocks are merged on a geometric schedule: with a block range `B` and
//! factor `f`, level `i` covers aligned windows of `B * f^i`. When every
//! block inside a completed window sits below that window's size and there
//! are at least two of them, they are merged into one block covering the
//! whole window.
//!
//! Merging is a pure function of its inputs. The engine swaps the result
//! into its block list and removes the inputs afterwards.

use crate::block::{BlockMeta, BlockReader, BlockWriter};
use crate::compression::CompressionConfig;
use crate::storage::align_down;
use crate::{Labels, Result, Sample, Timestamp};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Compaction schedule
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Smallest block range
    pub block_range: Timestamp,
    /// Number of levels above the smallest range
    pub levels: usize,
    /// Range multiplier between levels
    pub factor: i64,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            block_range: crate::config::BLOCK_RANGE_MS,
            levels: crate::config::COMPACTION_LEVELS,
            factor: crate::config::COMPACTION_FACTOR,
        }
    }
}

impl CompactionConfig {
    /// Window sizes, smallest first
    pub fn ranges(&self) -> Vec<Timestamp> {
        let mut ranges = Vec::with_capacity(self.levels + 1);
        let mut range = self.block_range;
        for _ in 0..=self.levels {
            ranges.push(range);
            range = range.saturating_mul(self.factor);
        }
        ranges
    }
}

/// A set of blocks to merge into one window
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionTask {
    pub min_time: Timestamp,
    pub max_time: Timestamp,
    /// Ids of the input blocks
    pub inputs: Vec<String>,
}

/// Pick the next merge, if any.
///
/// `limit` is the start of the data still held in memory; windows ending
/// after it may still receive blocks and are left alone.
pub fn plan(config: &CompactionConfig, blocks: &[BlockMeta], limit: Timestamp) -> Option<CompactionTask> {
    for range in config.ranges().into_iter().skip(1) {
        let mut windows: BTreeMap<Timestamp, Vec<&BlockMeta>> = BTreeMap::new();
        for meta in blocks {
            windows
                .entry(align_down(meta.min_time, range))
                .or_default()
                .push(meta);
        }

        for (start, members) in windows {
            let end = start.saturating_add(range);
            if end > limit || members.len() < 2 {
                continue;
            }
            if members.iter().any(|m| m.max_time > end || m.range() >= range) {
                continue;
            }
            return Some(CompactionTask {
                min_time: start,
                max_time: end,
                inputs: members.iter().map(|m| m.id.clone()).collect(),
            });
        }
    }
    None
}

/// Merge `inputs` into one block in `blocks_dir`.
///
/// Overlapping samples are deduplicated with later inputs taking
/// precedence, tombstoned samples are dropped and chunks are re-cut.
/// Returns `None` when nothing survives the merge.
pub fn compact(
    inputs: &[Arc<BlockReader>],
    blocks_dir: &Path,
    min_time: Timestamp,
    max_time: Timestamp,
    compression: CompressionConfig,
) -> Result<Option<(BlockMeta, PathBuf)>> {
    let mut by_labels: BTreeMap<Labels, Vec<(usize, u32)>> = BTreeMap::new();
    for (i, block) in inputs.iter().enumerate() {
        for (id, entry) in block.select(&[]) {
            by_labels.entry(entry.labels.clone()).or_default().push((i, id));
        }
    }

    let level = inputs
        .iter()
        .map(|b| b.meta().compaction.level)
        .max()
        .unwrap_or(0)
        + 1;
    // every block the output supersedes, including ones merged earlier
    let sources: Vec<String> = inputs
        .iter()
        .flat_map(|b| {
            let meta = b.meta();
            std::iter::once(meta.id.clone()).chain(meta.compaction.sources.iter().cloned())
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let mut writer = BlockWriter::new(blocks_dir, min_time, max_time, level, sources, compression)?;

    let tombstones: Vec<_> = inputs.iter().map(|b| b.tombstones()).collect();
    for (labels, parts) in by_labels {
        let mut merged: BTreeMap<Timestamp, f64> = BTreeMap::new();
        for (i, id) in parts {
            let samples = match inputs[i].series_samples(id) {
                Ok(samples) => samples,
                Err(e) => {
                    writer.abort()?;
                    return Err(e);
                }
            };
            for s in samples {
                if !tombstones[i].is_deleted(id, s.t) {
                    merged.insert(s.t, s.v);
                }
            }
        }
        let samples: Vec<Sample> = merged.into_iter().map(|(t, v)| Sample::new(t, v)).collect();
        writer.add_series(&labels, &samples)?;
    }

    if writer.num_series() == 0 {
        writer.abort()?;
        return Ok(None);
    }
    let (meta, dir) = writer.finish()?;
    info!(
        "Compacted {} blocks into {} [{}, {}) level {}",
        inputs.len(),
        meta.id,
        meta.min_time,
        meta.max_time,
        meta.compaction.level
    );
    Ok(Some((meta, dir)))
}
