//! Storage engine - coordinates the index, WAL, head and blocks

mod engine;
mod querier;

pub use engine::{Engine, EngineStats, MaintenanceReport};
pub use querier::{Querier, Series, SeriesIterator};

use crate::compression::CompressionConfig;
use crate::wal::WalConfig;
use crate::{Error, Labels, Result, Timestamp};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Block directory under the data directory
pub const BLOCKS_DIR: &str = "blocks";

/// WAL directory under the data directory
pub const WAL_DIR: &str = "wal";

/// Storage engine configuration
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// Data directory; holds `wal/` and `blocks/`
    pub data_dir: PathBuf,
    /// WAL configuration; `dir` is replaced by `data_dir/wal`
    pub wal: WalConfig,
    /// Chunk layout
    pub compression: CompressionConfig,
    /// Head block range and smallest block size
    pub block_range: Timestamp,
    /// How far behind the newest sample the head keeps accepting writes
    pub cutover_grace: Timestamp,
    /// Data older than this, relative to the newest sample, is deleted
    pub retention: Timestamp,
    /// Number of compaction levels above the block range
    pub compaction_levels: usize,
    /// Range multiplier between levels
    pub compaction_factor: i64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            wal: WalConfig::default(),
            compression: CompressionConfig::default(),
            block_range: crate::config::BLOCK_RANGE_MS,
            cutover_grace: crate::config::BLOCK_RANGE_MS / 2,
            retention: crate::config::RETENTION_MS,
            compaction_levels: crate::config::COMPACTION_LEVELS,
            compaction_factor: crate::config::COMPACTION_FACTOR,
        }
    }
}

impl StorageConfig {
    /// Defaults rooted at `data_dir`
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_range <= 0 {
            return Err(Error::Config("block range must be positive".into()));
        }
        if self.cutover_grace < 0 || self.cutover_grace >= self.block_range {
            return Err(Error::Config(
                "cutover grace must be non-negative and smaller than the block range".into(),
            ));
        }
        if self.retention <= 0 {
            return Err(Error::Config("retention must be positive".into()));
        }
        if self.compaction_factor < 2 {
            return Err(Error::Config("compaction factor must be at least 2".into()));
        }
        Ok(())
    }
}

/// Entry point for writing samples, implemented by [`Engine`]
pub trait Appender: Send + Sync {
    /// Append a batch atomically; rejected samples are counted, not fatal
    fn append_batch(&self, samples: Vec<(Labels, Timestamp, f64)>) -> Result<AppendStats>;
}

/// Outcome of one append batch
#[derive(Debug, Default)]
pub struct AppendStats {
    pub appended: usize,
    pub out_of_order: usize,
    pub out_of_bounds: usize,
    pub invalid: usize,
    /// The first rejection, for callers appending a single sample
    pub first_rejection: Option<Error>,
}

impl AppendStats {
    pub fn rejected(&self) -> usize {
        self.out_of_order + self.out_of_bounds + self.invalid
    }

    fn reject(&mut self, err: Error) {
        match &err {
            Error::OutOfOrder { .. } => self.out_of_order += 1,
            Error::OutOfBounds { .. } => self.out_of_bounds += 1,
            _ => self.invalid += 1,
        }
        if self.first_rejection.is_none() {
            self.first_rejection = Some(err);
        }
    }
}

/// Engine counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub samples_appended: AtomicU64,
    pub out_of_order: AtomicU64,
    pub out_of_bounds: AtomicU64,
    pub invalid_labels: AtomicU64,
    pub wal_failures: AtomicU64,
    pub cutovers: AtomicU64,
    pub compactions: AtomicU64,
    pub compaction_failures: AtomicU64,
    pub blocks_deleted: AtomicU64,
    pub blocks_quarantined: AtomicU64,
    pub series_removed: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    pub samples_appended: u64,
    pub out_of_order: u64,
    pub out_of_bounds: u64,
    pub invalid_labels: u64,
    pub wal_failures: u64,
    pub cutovers: u64,
    pub compactions: u64,
    pub compaction_failures: u64,
    pub blocks_deleted: u64,
    pub blocks_quarantined: u64,
    pub series_removed: u64,
}

impl EngineMetrics {
    pub(crate) fn record(&self, stats: &AppendStats) {
        self.samples_appended.fetch_add(stats.appended as u64, Ordering::Relaxed);
        self.out_of_order.fetch_add(stats.out_of_order as u64, Ordering::Relaxed);
        self.out_of_bounds.fetch_add(stats.out_of_bounds as u64, Ordering::Relaxed);
        self.invalid_labels.fetch_add(stats.invalid as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            samples_appended: get(&self.samples_appended),
            out_of_order: get(&self.out_of_order),
            out_of_bounds: get(&self.out_of_bounds),
            invalid_labels: get(&self.invalid_labels),
            wal_failures: get(&self.wal_failures),
            cutovers: get(&self.cutovers),
            compactions: get(&self.compactions),
            compaction_failures: get(&self.compaction_failures),
            blocks_deleted: get(&self.blocks_deleted),
            blocks_quarantined: get(&self.blocks_quarantined),
            series_removed: get(&self.series_removed),
        }
    }
}

/// Round down to a multiple of `range`, also for negative timestamps
pub fn align_down(t: Timestamp, range: Timestamp) -> Timestamp {
    t.div_euclid(range) * range
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(7_199_999, 7_200_000), 0);
        assert_eq!(align_down(7_200_000, 7_200_000), 7_200_000);
        assert_eq!(align_down(-1, 7_200_000), -7_200_000);
    }

    #[test]
    fn test_config_validation() {
        assert!(StorageConfig::default().validate().is_ok());
        let bad = StorageConfig {
            cutover_grace: crate::config::BLOCK_RANGE_MS,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
