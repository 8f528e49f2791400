//! Head block
//!
//! The head holds the most recent samples of every active series in
//! memory. It accepts samples at or after `min_valid`; everything older
//! belongs to persisted blocks. When enough data has accumulated the
//! engine freezes the head, flushes it to blocks and starts a new one.

mod series;

pub use series::{MemSeries, SeriesChunks};

use crate::block::{Interval, Tombstones};
use crate::wal::{SeriesRecord, WalRecord, WalWriter};
use crate::{Labels, Result, SeriesRef, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// The mutable in-memory block
pub struct Head {
    min_valid: Timestamp,
    samples_per_chunk: usize,
    series: RwLock<HashMap<SeriesRef, Arc<MemSeries>>>,
    tombstones: RwLock<Tombstones>,
    min_time: AtomicI64,
    max_time: AtomicI64,
    num_samples: AtomicU64,
}

/// Read view of a head: which samples of each series are visible
#[derive(Clone)]
pub struct HeadSnapshot {
    pub head: Arc<Head>,
    pub counts: Arc<HashMap<SeriesRef, usize>>,
    pub tombstones: Arc<Tombstones>,
}

impl Head {
    pub fn new(min_valid: Timestamp, samples_per_chunk: usize) -> Self {
        Self {
            min_valid,
            samples_per_chunk,
            series: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(Tombstones::new()),
            min_time: AtomicI64::new(i64::MAX),
            max_time: AtomicI64::new(i64::MIN),
            num_samples: AtomicU64::new(0),
        }
    }

    /// Lowest timestamp the head accepts
    pub fn min_valid(&self) -> Timestamp {
        self.min_valid
    }

    /// Smallest sample timestamp seen, if any
    pub fn min_time(&self) -> Option<Timestamp> {
        let t = self.min_time.load(Ordering::Acquire);
        (t != i64::MAX).then_some(t)
    }

    /// Largest sample timestamp seen, if any
    pub fn max_time(&self) -> Option<Timestamp> {
        let t = self.max_time.load(Ordering::Acquire);
        (t != i64::MIN).then_some(t)
    }

    pub fn num_samples(&self) -> u64 {
        self.num_samples.load(Ordering::Relaxed)
    }

    pub fn num_series(&self) -> usize {
        self.series.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.max_time().is_none()
    }

    pub fn get(&self, series_ref: SeriesRef) -> Option<Arc<MemSeries>> {
        self.series.read().get(&series_ref).cloned()
    }

    /// Find or add a series.
    ///
    /// A newly added series is logged to `wal` before it becomes visible,
    /// so its definition always precedes its samples in the log.
    pub fn get_or_create(
        &self,
        series_ref: SeriesRef,
        labels: &Labels,
        wal: Option<&WalWriter>,
    ) -> Result<Arc<MemSeries>> {
        if let Some(series) = self.series.read().get(&series_ref) {
            return Ok(series.clone());
        }
        let mut map = self.series.write();
        if let Some(series) = map.get(&series_ref) {
            return Ok(series.clone());
        }
        if let Some(wal) = wal {
            wal.log(&WalRecord::Series(vec![SeriesRecord {
                series_ref,
                labels: labels.clone(),
            }]))?;
        }
        let series = Arc::new(MemSeries::new(series_ref, labels.clone(), self.samples_per_chunk));
        map.insert(series_ref, series.clone());
        Ok(series)
    }

    /// Every series, in reference order
    pub fn all_series(&self) -> Vec<Arc<MemSeries>> {
        let mut all: Vec<Arc<MemSeries>> = self.series.read().values().cloned().collect();
        all.sort_by_key(|s| s.series_ref());
        all
    }

    /// Record that samples in `[mint, maxt]` were accepted
    pub(crate) fn observe(&self, mint: Timestamp, maxt: Timestamp, count: usize) {
        self.min_time.fetch_min(mint, Ordering::AcqRel);
        self.max_time.fetch_max(maxt, Ordering::AcqRel);
        self.num_samples.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn add_tombstone(&self, series_ref: SeriesRef, interval: Interval) {
        self.tombstones.write().add(series_ref, interval);
    }

    pub fn tombstones(&self) -> Tombstones {
        self.tombstones.read().clone()
    }

    pub fn tombstones_for(&self, series_ref: SeriesRef) -> Vec<Interval> {
        self.tombstones.read().get(series_ref).to_vec()
    }

    /// Capture the currently published state of every series.
    ///
    /// Callers must exclude appends while this runs, otherwise a
    /// multi-series batch could be half visible.
    pub fn snapshot(self: &Arc<Self>) -> HeadSnapshot {
        let counts = self
            .series
            .read()
            .iter()
            .map(|(r, s)| (*r, s.published()))
            .collect();
        HeadSnapshot {
            head: self.clone(),
            counts: Arc::new(counts),
            tombstones: Arc::new(self.tombstones()),
        }
    }
}

impl HeadSnapshot {
    /// Visible sample count of a series, zero if it did not exist yet
    pub fn count(&self, series_ref: SeriesRef) -> usize {
        self.counts.get(&series_ref).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::{WalConfig, WalReader};
    use tempfile::TempDir;

    #[test]
    fn test_series_logged_once() {
        let temp_dir = TempDir::new().unwrap();
        let config = WalConfig {
            dir: temp_dir.path().to_path_buf(),
            ..Default::default()
        };
        let wal = WalWriter::new(config).unwrap();
        let head = Head::new(0, 120);
        let labels = Labels::from_pairs(&[("__name__", "up")]);

        let a = head.get_or_create(3, &labels, Some(&wal)).unwrap();
        let b = head.get_or_create(3, &labels, Some(&wal)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        wal.sync().unwrap();

        let mut records = Vec::new();
        WalReader::new(temp_dir.path())
            .replay(|r| {
                records.push(r);
                Ok(())
            })
            .unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_snapshot_counts() {
        let head = Arc::new(Head::new(0, 120));
        let labels = Labels::from_pairs(&[("__name__", "up")]);
        let series = head.get_or_create(1, &labels, None).unwrap();
        {
            let mut chunks = series.lock();
            chunks.append(10, 1.0);
            series.publish(&chunks);
        }
        head.observe(10, 10, 1);

        let snap = head.snapshot();
        {
            let mut chunks = series.lock();
            chunks.append(20, 2.0);
            series.publish(&chunks);
        }
        assert_eq!(snap.count(1), 1);
        assert_eq!(snap.count(2), 0);
        assert_eq!(head.min_time(), Some(10));
        assert_eq!(head.max_time(), Some(10));
    }
}
