//! Storage engine - top-level coordinator

use super::{align_down, AppendStats, Appender, EngineMetrics, MetricsSnapshot, Querier, StorageConfig};
use crate::block::{self, BlockReader, BlockWriter, Interval};
use crate::compaction::{self, CompactionConfig};
use crate::head::{Head, MemSeries};
use crate::index::SeriesIndex;
use crate::wal::{SampleRecord, SeriesRecord, TombstoneRecord, WalConfig, WalReader, WalRecord, WalWriter};
use crate::{Error, Labels, Matcher, Result, Sample, SeriesRef, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Samples per WAL record when re-logging head data
const RELOG_BATCH: usize = 10_000;

/// FluxMon storage engine
pub struct Engine {
    config: StorageConfig,
    blocks_dir: PathBuf,
    index: Arc<SeriesIndex>,
    wal: WalWriter,
    state: RwLock<EngineState>,
    /// Serializes cutover, flush, compaction, retention and deletes
    maintenance: Mutex<()>,
    wal_failed: AtomicBool,
    wal_error: Mutex<Option<String>>,
    metrics: EngineMetrics,
}

struct EngineState {
    head: Arc<Head>,
    /// Heads cut over but not yet persisted, oldest first
    frozen: Vec<FrozenHead>,
    /// Persisted heads some querier may still read
    retired: Vec<Arc<Head>>,
    blocks: Arc<Vec<Arc<BlockReader>>>,
}

#[derive(Clone)]
struct FrozenHead {
    head: Arc<Head>,
    /// Exclusive upper bound of the data this head still owns
    upto: Timestamp,
    /// First WAL segment not needed once this head is persisted
    checkpoint: u64,
}

/// Engine statistics
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub num_series: usize,
    pub head_series: usize,
    pub head_samples: u64,
    pub head_min_time: Option<Timestamp>,
    pub head_max_time: Option<Timestamp>,
    pub head_min_valid: Timestamp,
    pub frozen_heads: usize,
    pub num_blocks: usize,
    pub blocks_bytes: u64,
    pub wal_segment: u64,
    pub wal_healthy: bool,
    pub metrics: MetricsSnapshot,
}

/// What one maintenance pass did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub cutover: bool,
    pub blocks_written: usize,
    pub compactions: usize,
    pub blocks_deleted: usize,
    pub blocks_quarantined: usize,
    pub series_removed: usize,
}

impl Engine {
    /// Open the data directory, load blocks and replay the WAL
    pub fn open(config: StorageConfig) -> Result<Self> {
        config.validate()?;
        let blocks_dir = config.data_dir.join(super::BLOCKS_DIR);
        let wal_dir = config.data_dir.join(super::WAL_DIR);
        std::fs::create_dir_all(&blocks_dir)?;
        std::fs::create_dir_all(&wal_dir)?;

        let removed = block::remove_tmp_dirs(&blocks_dir)?;
        if removed > 0 {
            info!("Removed {} incomplete block directories", removed);
        }

        let metrics = EngineMetrics::default();
        let mut blocks = Vec::new();
        for dir in block::list_block_dirs(&blocks_dir)? {
            match BlockReader::open(&dir) {
                Ok(reader) => blocks.push(Arc::new(reader)),
                Err(e) => {
                    error!("Failed to open block {:?}, quarantining: {}", dir, e);
                    block::quarantine(&blocks_dir, &dir)?;
                    metrics.blocks_quarantined.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        let blocks = Self::drop_superseded(blocks);
        let min_valid = blocks
            .iter()
            .map(|b| b.meta().max_time)
            .max()
            .unwrap_or(Timestamp::MIN);
        info!("Loaded {} blocks, head accepts samples from {}", blocks.len(), min_valid);

        let index = Arc::new(SeriesIndex::new());
        let head = Arc::new(Head::new(min_valid, config.compression.samples_per_chunk));
        Self::replay(&wal_dir, &index, &head)?;

        let wal = WalWriter::new(WalConfig {
            dir: wal_dir,
            ..config.wal.clone()
        })?;
        // the new segment must declare the references its samples will use
        let declared: Vec<SeriesRecord> = head
            .all_series()
            .iter()
            .map(|s| SeriesRecord {
                series_ref: s.series_ref(),
                labels: s.labels().clone(),
            })
            .collect();
        for part in declared.chunks(RELOG_BATCH) {
            wal.log(&WalRecord::Series(part.to_vec()))?;
        }
        wal.sync()?;

        Ok(Self {
            config,
            blocks_dir,
            index,
            wal,
            state: RwLock::new(EngineState {
                head,
                frozen: Vec::new(),
                retired: Vec::new(),
                blocks: Arc::new(blocks),
            }),
            maintenance: Mutex::new(()),
            wal_failed: AtomicBool::new(false),
            wal_error: Mutex::new(None),
            metrics,
        })
    }

    /// Remove blocks a completed compaction already merged.
    ///
    /// A crash between writing a merged block and deleting its inputs
    /// leaves both on disk.
    fn drop_superseded(blocks: Vec<Arc<BlockReader>>) -> Vec<Arc<BlockReader>> {
        let merged: HashSet<&str> = blocks
            .iter()
            .flat_map(|b| b.meta().compaction.sources.iter().map(String::as_str))
            .collect();
        let (superseded, mut keep): (Vec<_>, Vec<_>) = blocks
            .iter()
            .cloned()
            .partition(|b| merged.contains(b.meta().id.as_str()));
        for b in superseded {
            info!("Removing block {} left over from an interrupted compaction", b.meta().id);
            if let Err(e) = std::fs::remove_dir_all(b.dir()) {
                warn!("Failed to remove superseded block {:?}: {}", b.dir(), e);
            }
        }
        keep.sort_by_key(|b| b.meta().min_time);
        keep
    }

    /// Rebuild the head from the WAL.
    ///
    /// References in the log belong to the process that wrote them, so
    /// every series definition is re-resolved through the index. Samples
    /// already persisted in blocks or out of order are skipped.
    fn replay(wal_dir: &std::path::Path, index: &SeriesIndex, head: &Head) -> Result<()> {
        let mut remap: HashMap<SeriesRef, Arc<MemSeries>> = HashMap::new();
        let mut samples = 0usize;
        let mut skipped = 0usize;

        let stats = WalReader::new(wal_dir).replay(|record| {
            match record {
                WalRecord::Series(series) => {
                    for s in series {
                        match index.get_or_create(&s.labels) {
                            Ok((r, _)) => {
                                let mem = head.get_or_create(r, &s.labels, None)?;
                                remap.insert(s.series_ref, mem);
                            }
                            Err(e) => warn!("Skipping invalid series in WAL: {}", e),
                        }
                    }
                }
                WalRecord::Samples(records) => {
                    let mut mint = Timestamp::MAX;
                    let mut maxt = Timestamp::MIN;
                    let mut count = 0;
                    for rec in records {
                        let Some(series) = remap.get(&rec.series_ref) else {
                            skipped += 1;
                            continue;
                        };
                        if rec.t < head.min_valid() {
                            skipped += 1;
                            continue;
                        }
                        let mut chunks = series.lock();
                        if chunks.last_t().map_or(false, |last| rec.t <= last) {
                            skipped += 1;
                            continue;
                        }
                        chunks.append(rec.t, rec.v);
                        series.publish(&chunks);
                        mint = mint.min(rec.t);
                        maxt = maxt.max(rec.t);
                        count += 1;
                    }
                    if count > 0 {
                        head.observe(mint, maxt, count);
                        samples += count;
                    }
                }
                WalRecord::Tombstones(records) => {
                    for rec in records {
                        if let Some(series) = remap.get(&rec.series_ref) {
                            head.add_tombstone(series.series_ref(), Interval::new(rec.mint, rec.maxt));
                        }
                    }
                }
            }
            Ok(())
        })?;

        if stats.records > 0 {
            info!(
                "WAL replay: {} records from {} segments, {} samples restored, {} skipped",
                stats.records, stats.segments, samples, skipped
            );
        }
        if stats.corrupt_segments > 0 {
            warn!("WAL replay stopped early in {} corrupt segments", stats.corrupt_segments);
        }
        Ok(())
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn index(&self) -> &Arc<SeriesIndex> {
        &self.index
    }

    /// Append one sample
    pub fn append(&self, labels: Labels, t: Timestamp, v: f64) -> Result<()> {
        let stats = self.append_batch(vec![(labels, t, v)])?;
        match stats.first_rejection {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Append a batch.
    ///
    /// Every sample is checked against its series' last timestamp and the
    /// head's lower bound. Accepted samples are logged as one WAL record
    /// and then published together, so readers see all or none of them.
    pub fn append_batch(&self, batch: Vec<(Labels, Timestamp, f64)>) -> Result<AppendStats> {
        let state = self.state.read();
        self.check_writable()?;
        let head = state.head.clone();

        let mut stats = AppendStats::default();
        let mut groups: BTreeMap<SeriesRef, (Arc<MemSeries>, Vec<(Timestamp, f64)>)> = BTreeMap::new();
        for (labels, t, v) in batch {
            let series_ref = match self.index.get_or_create(&labels) {
                Ok((r, _)) => r,
                Err(e) => {
                    stats.reject(e);
                    continue;
                }
            };
            if !groups.contains_key(&series_ref) {
                let series = head
                    .get_or_create(series_ref, &labels, Some(&self.wal))
                    .map_err(|e| self.wal_failure(e))?;
                groups.insert(series_ref, (series, Vec::new()));
            }
            if let Some((_, samples)) = groups.get_mut(&series_ref) {
                samples.push((t, v));
            }
        }

        // series locks are always taken in reference order
        let mut locked = Vec::with_capacity(groups.len());
        let mut records = Vec::new();
        for (series, samples) in groups.values() {
            let chunks = series.lock();
            let mut last = chunks.last_t();
            let mut accepted = Vec::with_capacity(samples.len());
            for &(t, v) in samples {
                if t < head.min_valid() {
                    stats.reject(Error::OutOfBounds {
                        timestamp: t,
                        min_valid: head.min_valid(),
                    });
                    continue;
                }
                if let Some(last_t) = last {
                    if t <= last_t {
                        stats.reject(Error::OutOfOrder {
                            series: series.labels().to_string(),
                            timestamp: t,
                            last: last_t,
                        });
                        continue;
                    }
                }
                last = Some(t);
                accepted.push((t, v));
                records.push(SampleRecord {
                    series_ref: series.series_ref(),
                    t,
                    v,
                });
            }
            locked.push((series, chunks, accepted));
        }

        if !records.is_empty() {
            self.wal
                .log(&WalRecord::Samples(records))
                .map_err(|e| self.wal_failure(e))?;
        }

        let mut mint = Timestamp::MAX;
        let mut maxt = Timestamp::MIN;
        for (_, chunks, accepted) in locked.iter_mut() {
            for &(t, v) in accepted.iter() {
                chunks.append(t, v);
                mint = mint.min(t);
                maxt = maxt.max(t);
            }
            stats.appended += accepted.len();
        }
        for (series, chunks, _) in &locked {
            series.publish(chunks);
        }
        drop(locked);

        if stats.appended > 0 {
            head.observe(mint, maxt, stats.appended);
        }
        self.metrics.record(&stats);
        Ok(stats)
    }

    fn check_writable(&self) -> Result<()> {
        if self.wal_failed.load(Ordering::SeqCst) {
            let reason = self
                .wal_error
                .lock()
                .clone()
                .unwrap_or_else(|| "WAL failure".to_string());
            return Err(Error::Unavailable(format!("writes refused after WAL failure: {}", reason)));
        }
        Ok(())
    }

    /// Mark the write path failed and convert the error
    fn wal_failure(&self, err: Error) -> Error {
        if !self.wal_failed.swap(true, Ordering::SeqCst) {
            error!("WAL write failed, refusing further writes: {}", err);
        }
        self.metrics.wal_failures.fetch_add(1, Ordering::Relaxed);
        *self.wal_error.lock() = Some(err.to_string());
        Error::Unavailable(err.to_string())
    }

    /// Consistent read snapshot
    pub fn querier(&self) -> Querier {
        // the write lock waits out in-flight batches
        let state = self.state.write();
        let head = state.head.snapshot();
        let frozen = state
            .frozen
            .iter()
            .map(|f| (f.head.snapshot(), f.upto))
            .collect();
        let blocks = state.blocks.as_ref().clone();
        drop(state);
        Querier::new(self.index.clone(), head, frozen, blocks)
    }

    /// Hide samples of matching series in `[mint, maxt]`
    pub fn delete_series(&self, matchers: &[Matcher], mint: Timestamp, maxt: Timestamp) -> Result<usize> {
        // flush and compaction copy tombstones once, so they must not run
        // while new ones are added
        let _guard = self.maintenance.lock();
        let state = self.state.read();
        let interval = Interval::new(mint, maxt);
        let mut affected = BTreeSet::new();

        let mut records = Vec::new();
        for (series_ref, labels) in self.index.select(matchers) {
            let heads = std::iter::once(&state.head).chain(state.frozen.iter().map(|f| &f.head));
            let mut present = false;
            for head in heads {
                if head.get(series_ref).is_some() {
                    head.add_tombstone(series_ref, interval);
                    present = true;
                }
            }
            if present {
                records.push(TombstoneRecord { series_ref, mint, maxt });
                affected.insert(labels);
            }
        }
        if !records.is_empty() {
            self.check_writable()?;
            self.wal
                .log(&WalRecord::Tombstones(records))
                .map_err(|e| self.wal_failure(e))?;
        }

        for block in state.blocks.iter() {
            if !block.meta().overlaps(mint, maxt) {
                continue;
            }
            let hits = block.select(matchers);
            let ids: Vec<u32> = hits.iter().map(|(id, _)| *id).collect();
            block.add_tombstones(&ids, interval)?;
            affected.extend(hits.into_iter().map(|(_, e)| e.labels.clone()));
        }

        info!("Deleted [{}, {}] from {} series", mint, maxt, affected.len());
        Ok(affected.len())
    }

    /// Run one maintenance pass: cutover, flush, compaction and retention
    pub fn maintain(&self) -> Result<MaintenanceReport> {
        let _guard = self.maintenance.lock();
        let mut report = MaintenanceReport::default();

        report.blocks_quarantined = self.quarantine_corrupt()?;
        report.cutover = self.cutover_if_needed()?;
        report.blocks_written = self.flush_frozen()?;
        loop {
            match self.compact_once() {
                Ok(true) => report.compactions += 1,
                Ok(false) => break,
                Err(e) => {
                    self.metrics.compaction_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Compaction failed: {}", e);
                    break;
                }
            }
        }
        report.blocks_deleted = self.apply_retention()?;
        report.series_removed = self.gc_series();
        Ok(report)
    }

    /// Forget index entries of series that no head holds anymore.
    ///
    /// Persisted heads stay reachable through querier snapshots, so their
    /// series are kept until the last such querier is dropped.
    fn gc_series(&self) -> usize {
        let mut state = self.state.write();
        state.retired.retain(|head| Arc::strong_count(head) > 1);

        let heads = std::iter::once(&state.head)
            .chain(state.frozen.iter().map(|f| &f.head))
            .chain(state.retired.iter());
        let live: HashSet<SeriesRef> = heads
            .flat_map(|head| head.all_series())
            .map(|s| s.series_ref())
            .collect();
        let removed = self.index.retain(|r| live.contains(&r));
        drop(state);

        if removed > 0 {
            self.metrics.series_removed.fetch_add(removed as u64, Ordering::Relaxed);
            info!("Removed {} inactive series from the index", removed);
        }
        removed
    }

    /// Freeze the head once it holds a complete block range older than
    /// the grace period, and start a new head at that boundary.
    fn cutover_if_needed(&self) -> Result<bool> {
        let range = self.config.block_range;
        let head = self.state.read().head.clone();
        let (Some(min_t), Some(max_t)) = (head.min_time(), head.max_time()) else {
            return Ok(false);
        };
        let new_start = align_down(max_t - self.config.cutover_grace, range);
        if new_start <= align_down(min_t, range) {
            return Ok(false);
        }

        let mut state = self.state.write();
        self.check_writable()?;
        let checkpoint = self.wal.rotate().map_err(|e| self.wal_failure(e))?;
        let next = Arc::new(Head::new(new_start, self.config.compression.samples_per_chunk));

        // carry samples at or after the boundary into the new head
        let mut records = Vec::new();
        let tombstones = head.tombstones();
        for series in head.all_series() {
            let tail: Vec<Sample> = series
                .samples()?
                .into_iter()
                .filter(|s| s.t >= new_start && !tombstones.is_deleted(series.series_ref(), s.t))
                .collect();
            if tail.is_empty() {
                continue;
            }
            let mem = next
                .get_or_create(series.series_ref(), series.labels(), Some(&self.wal))
                .map_err(|e| self.wal_failure(e))?;
            let mut chunks = mem.lock();
            for s in &tail {
                chunks.append(s.t, s.v);
                records.push(SampleRecord {
                    series_ref: series.series_ref(),
                    t: s.t,
                    v: s.v,
                });
            }
            mem.publish(&chunks);
            drop(chunks);
            next.observe(tail[0].t, tail[tail.len() - 1].t, tail.len());
        }
        for part in records.chunks(RELOG_BATCH) {
            self.wal
                .log(&WalRecord::Samples(part.to_vec()))
                .map_err(|e| self.wal_failure(e))?;
        }

        state.frozen.push(FrozenHead {
            head,
            upto: new_start,
            checkpoint,
        });
        state.head = next;
        drop(state);

        self.metrics.cutovers.fetch_add(1, Ordering::Relaxed);
        info!("Head cut over at {}", new_start);
        Ok(true)
    }

    /// Persist frozen heads, oldest first, and drop the WAL they needed
    fn flush_frozen(&self) -> Result<usize> {
        let mut written = 0;
        loop {
            let Some(frozen) = self.state.read().frozen.first().cloned() else {
                return Ok(written);
            };
            let readers = match self.persist_head(&frozen.head, frozen.upto) {
                Ok(readers) => readers,
                Err(e) => {
                    error!("Failed to persist frozen head, will retry: {}", e);
                    return Err(e);
                }
            };
            written += readers.len();

            {
                let mut state = self.state.write();
                let mut blocks = state.blocks.as_ref().clone();
                blocks.extend(readers);
                blocks.sort_by_key(|b| b.meta().min_time);
                state.blocks = Arc::new(blocks);
                let done = state.frozen.remove(0);
                state.retired.push(done.head);
            }

            let removed = self.wal.truncate_before(frozen.checkpoint)?;
            debug!("Dropped {} WAL segments after flush", removed);
        }
    }

    /// Write the head's samples below `upto` into range-aligned blocks
    fn persist_head(&self, head: &Head, upto: Timestamp) -> Result<Vec<Arc<BlockReader>>> {
        let range = self.config.block_range;
        let tombstones = head.tombstones();
        let mut series = head.all_series();
        series.sort_by(|a, b| a.labels().cmp(b.labels()));

        let mut writers: BTreeMap<Timestamp, BlockWriter> = BTreeMap::new();
        let result = (|| -> Result<()> {
            for s in &series {
                let mut windows: BTreeMap<Timestamp, Vec<Sample>> = BTreeMap::new();
                for sample in s.samples()? {
                    if sample.t >= upto || tombstones.is_deleted(s.series_ref(), sample.t) {
                        continue;
                    }
                    windows.entry(align_down(sample.t, range)).or_default().push(sample);
                }
                for (start, samples) in windows {
                    let writer = match writers.entry(start) {
                        std::collections::btree_map::Entry::Occupied(e) => e.into_mut(),
                        std::collections::btree_map::Entry::Vacant(e) => e.insert(BlockWriter::new(
                            &self.blocks_dir,
                            start,
                            start + range,
                            1,
                            Vec::new(),
                            self.config.compression,
                        )?),
                    };
                    writer.add_series(s.labels(), &samples)?;
                }
            }
            Ok(())
        })();

        if let Err(e) = result {
            for (_, writer) in writers {
                writer.abort()?;
            }
            return Err(e);
        }

        let mut readers = Vec::with_capacity(writers.len());
        for (_, writer) in writers {
            let (meta, dir) = writer.finish()?;
            info!(
                "Persisted block {} [{}, {}) with {} series",
                meta.id, meta.min_time, meta.max_time, meta.stats.num_series
            );
            readers.push(Arc::new(BlockReader::open(&dir)?));
        }
        Ok(readers)
    }

    /// Merge one set of blocks if the planner finds one
    fn compact_once(&self) -> Result<bool> {
        let (blocks, limit) = {
            let state = self.state.read();
            let limit = state
                .frozen
                .iter()
                .map(|f| f.head.min_valid())
                .chain(std::iter::once(state.head.min_valid()))
                .min()
                .unwrap_or(Timestamp::MIN);
            (state.blocks.clone(), limit)
        };
        let config = CompactionConfig {
            block_range: self.config.block_range,
            levels: self.config.compaction_levels,
            factor: self.config.compaction_factor,
        };
        let metas: Vec<_> = blocks.iter().map(|b| b.meta().clone()).collect();
        let Some(task) = compaction::plan(&config, &metas, limit) else {
            return Ok(false);
        };

        let inputs: Vec<Arc<BlockReader>> = blocks
            .iter()
            .filter(|b| task.inputs.contains(&b.meta().id))
            .cloned()
            .collect();
        let output = compaction::compact(
            &inputs,
            &self.blocks_dir,
            task.min_time,
            task.max_time,
            self.config.compression,
        )?;
        let new_reader = match output {
            Some((_, dir)) => Some(Arc::new(BlockReader::open(&dir)?)),
            None => None,
        };

        {
            let mut state = self.state.write();
            let mut next: Vec<Arc<BlockReader>> = state
                .blocks
                .iter()
                .filter(|b| !task.inputs.contains(&b.meta().id))
                .cloned()
                .collect();
            next.extend(new_reader);
            next.sort_by_key(|b| b.meta().min_time);
            state.blocks = Arc::new(next);
        }
        for input in &inputs {
            if let Err(e) = std::fs::remove_dir_all(input.dir()) {
                warn!("Failed to remove compacted block {:?}: {}", input.dir(), e);
            }
        }
        self.metrics.compactions.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    /// Delete blocks entirely older than the retention window
    fn apply_retention(&self) -> Result<usize> {
        let expired: Vec<Arc<BlockReader>> = {
            let mut state = self.state.write();
            let newest = state
                .head
                .max_time()
                .into_iter()
                .chain(state.blocks.iter().map(|b| b.meta().max_time - 1))
                .max();
            let Some(newest) = newest else {
                return Ok(0);
            };
            let cutoff = newest - self.config.retention;
            let (expired, keep): (Vec<_>, Vec<_>) = state
                .blocks
                .iter()
                .cloned()
                .partition(|b| b.meta().max_time <= cutoff);
            if expired.is_empty() {
                return Ok(0);
            }
            state.blocks = Arc::new(keep);
            expired
        };

        for b in &expired {
            info!("Retention: deleting block {} [{}, {})", b.meta().id, b.meta().min_time, b.meta().max_time);
            std::fs::remove_dir_all(b.dir())?;
        }
        self.metrics
            .blocks_deleted
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        Ok(expired.len())
    }

    /// Move blocks found corrupt at read time out of the block list
    fn quarantine_corrupt(&self) -> Result<usize> {
        let corrupt: Vec<Arc<BlockReader>> = {
            let mut state = self.state.write();
            let (corrupt, keep): (Vec<_>, Vec<_>) =
                state.blocks.iter().cloned().partition(|b| b.is_corrupt());
            if corrupt.is_empty() {
                return Ok(0);
            }
            state.blocks = Arc::new(keep);
            corrupt
        };
        for b in &corrupt {
            let target = block::quarantine(&self.blocks_dir, b.dir())?;
            warn!("Quarantined corrupt block {} to {:?}", b.meta().id, target);
        }
        self.metrics
            .blocks_quarantined
            .fetch_add(corrupt.len() as u64, Ordering::Relaxed);
        Ok(corrupt.len())
    }

    /// Fsync the WAL
    pub fn sync_wal(&self) -> Result<()> {
        self.check_writable()?;
        self.wal.sync().map_err(|e| self.wal_failure(e))
    }

    /// Try to resume writes after a WAL failure by starting a new segment
    pub fn try_recover_wal(&self) -> Result<()> {
        if !self.wal_failed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let state = self.state.write();
        self.wal.rotate()?;
        let declared: Vec<SeriesRecord> = state
            .head
            .all_series()
            .iter()
            .map(|s| SeriesRecord {
                series_ref: s.series_ref(),
                labels: s.labels().clone(),
            })
            .collect();
        for part in declared.chunks(RELOG_BATCH) {
            self.wal.log(&WalRecord::Series(part.to_vec()))?;
        }
        self.wal.sync()?;
        self.wal_failed.store(false, Ordering::SeqCst);
        *self.wal_error.lock() = None;
        info!("WAL recovered, accepting writes again");
        Ok(())
    }

    /// Err while the write path is refusing appends
    pub fn health(&self) -> Result<()> {
        self.check_writable()
    }

    pub fn stats(&self) -> EngineStats {
        let state = self.state.read();
        EngineStats {
            num_series: self.index.len(),
            head_series: state.head.num_series(),
            head_samples: state.head.num_samples(),
            head_min_time: state.head.min_time(),
            head_max_time: state.head.max_time(),
            head_min_valid: state.head.min_valid(),
            frozen_heads: state.frozen.len(),
            num_blocks: state.blocks.len(),
            blocks_bytes: state.blocks.iter().map(|b| b.size_bytes()).sum(),
            wal_segment: self.wal.current_segment(),
            wal_healthy: !self.wal_failed.load(Ordering::SeqCst),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Metadata of every loaded block
    pub fn blocks(&self) -> Vec<block::BlockMeta> {
        self.state.read().blocks.iter().map(|b| b.meta().clone()).collect()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Sync the WAL before shutdown
    pub fn close(&self) -> Result<()> {
        if self.wal_failed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.wal.sync()?;
        info!("Storage engine closed");
        Ok(())
    }
}

impl Appender for Engine {
    fn append_batch(&self, samples: Vec<(Labels, Timestamp, f64)>) -> Result<AppendStats> {
        Engine::append_batch(self, samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::SyncPolicy;
    use tempfile::TempDir;

    const H: Timestamp = 3_600_000;

    fn config(dir: &std::path::Path) -> StorageConfig {
        let mut config = StorageConfig::with_data_dir(dir);
        config.wal.sync_policy = SyncPolicy::Immediate;
        config
    }

    fn cpu(host: &str) -> Labels {
        Labels::from_pairs(&[("__name__", "cpu"), ("host", host)])
    }

    fn read_all(engine: &Engine, labels: &Labels) -> Vec<Sample> {
        let matchers: Vec<Matcher> = labels.iter().map(|l| Matcher::equal(&l.name, &l.value)).collect();
        engine
            .querier()
            .select(&matchers, Timestamp::MIN, Timestamp::MAX)
            .first()
            .map(|s| s.iter().collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_append_and_read() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        for i in 0..500 {
            engine.append(cpu("a"), i * 1000, i as f64).unwrap();
        }
        let samples = read_all(&engine, &cpu("a"));
        assert_eq!(samples.len(), 500);
        assert_eq!(samples[499], Sample::new(499_000, 499.0));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        engine.append(cpu("a"), 2000, 2.0).unwrap();
        let err = engine.append(cpu("a"), 2000, 3.0).unwrap_err();
        assert!(matches!(err, Error::OutOfOrder { .. }));
        assert!(matches!(engine.append(cpu("a"), 1000, 1.0), Err(Error::OutOfOrder { .. })));
        assert_eq!(read_all(&engine, &cpu("a")), vec![Sample::new(2000, 2.0)]);
        assert_eq!(engine.stats().metrics.out_of_order, 2);
    }

    #[test]
    fn test_invalid_labels_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        let stats = engine
            .append_batch(vec![
                (Labels::from_pairs(&[("job", "x")]), 1, 1.0),
                (cpu("a"), 1, 1.0),
            ])
            .unwrap();
        assert_eq!(stats.appended, 1);
        assert_eq!(stats.invalid, 1);
    }

    #[test]
    fn test_replay_after_restart() {
        let temp_dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(config(temp_dir.path())).unwrap();
            for i in 0..100 {
                engine
                    .append_batch(vec![(cpu("a"), i * 1000, i as f64), (cpu("b"), i * 1000, -(i as f64))])
                    .unwrap();
            }
        }
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        assert_eq!(read_all(&engine, &cpu("a")).len(), 100);
        assert_eq!(read_all(&engine, &cpu("b"))[99], Sample::new(99_000, -99.0));

        // references from both processes survive a second restart
        engine.append(cpu("c"), 1, 1.0).unwrap();
        engine.append(cpu("a"), 100_000, 100.0).unwrap();
        drop(engine);
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        assert_eq!(read_all(&engine, &cpu("a")).len(), 101);
        assert_eq!(read_all(&engine, &cpu("c")).len(), 1);
        assert_eq!(read_all(&engine, &cpu("b")).len(), 100);
    }

    #[test]
    fn test_querier_is_a_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        engine.append(cpu("a"), 1, 1.0).unwrap();
        let querier = engine.querier();
        engine.append(cpu("a"), 2, 2.0).unwrap();
        engine.append(cpu("b"), 2, 2.0).unwrap();

        let all = querier.select(&[Matcher::metric_name("cpu")], 0, 10);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].iter().count(), 1);
    }

    #[test]
    fn test_cutover_flush_and_restart() {
        let temp_dir = TempDir::new().unwrap();
        let before;
        {
            let engine = Engine::open(config(temp_dir.path())).unwrap();
            for i in 0..(5 * 60) {
                engine.append(cpu("a"), i * 60_000, i as f64).unwrap();
            }
            before = read_all(&engine, &cpu("a"));
            let report = engine.maintain().unwrap();
            assert!(report.cutover);
            assert!(report.blocks_written >= 1);
            assert_eq!(read_all(&engine, &cpu("a")), before);

            // samples below the new head's bound are refused
            let min_valid = engine.stats().head_min_valid;
            assert!(matches!(
                engine.append(cpu("z"), min_valid - 1, 1.0),
                Err(Error::OutOfBounds { .. })
            ));
        }
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        assert_eq!(read_all(&engine, &cpu("a")), before);
        assert!(engine.stats().num_blocks >= 1);
    }

    #[test]
    fn test_compaction_is_read_transparent() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        for i in 0..(10 * 60) {
            engine
                .append_batch(vec![(cpu("a"), i * 60_000, i as f64), (cpu("b"), i * 60_000, 1.0)])
                .unwrap();
            // cut over as data arrives
            if i % 60 == 0 {
                engine.maintain().unwrap();
            }
        }
        engine.maintain().unwrap();
        let metrics = engine.stats().metrics;
        assert!(metrics.compactions >= 1, "expected a compaction, got {:?}", metrics);
        let after = read_all(&engine, &cpu("a"));
        assert_eq!(after.len(), 600);
        assert!(after.windows(2).all(|w| w[0].t < w[1].t));
        assert!(engine.blocks().iter().any(|b| b.max_time - b.min_time == 6 * H));
    }

    #[test]
    fn test_delete_series() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        for i in 0..10 {
            engine.append(cpu("a"), i * 1000, i as f64).unwrap();
            engine.append(cpu("b"), i * 1000, i as f64).unwrap();
        }
        let n = engine
            .delete_series(&[Matcher::equal("host", "a")], 0, 4999)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(read_all(&engine, &cpu("a")).len(), 5);
        assert_eq!(read_all(&engine, &cpu("b")).len(), 10);
        drop(engine);

        let engine = Engine::open(config(temp_dir.path())).unwrap();
        assert_eq!(read_all(&engine, &cpu("a")).len(), 5);
    }

    #[test]
    fn test_retention_deletes_whole_blocks() {
        let temp_dir = TempDir::new().unwrap();
        let mut cfg = config(temp_dir.path());
        cfg.retention = 4 * H;
        cfg.compaction_levels = 0;
        let engine = Engine::open(cfg).unwrap();
        for i in 0..(12 * 60) {
            engine.append(cpu("a"), i * 60_000, 1.0).unwrap();
        }
        let report = engine.maintain().unwrap();
        assert!(report.blocks_deleted > 0);
        let oldest = read_all(&engine, &cpu("a"))[0].t;
        assert_eq!(oldest % (2 * H), 0);
        assert!(oldest > 0);
    }

    #[test]
    fn test_corrupt_block_quarantined_on_open() {
        let temp_dir = TempDir::new().unwrap();
        {
            let engine = Engine::open(config(temp_dir.path())).unwrap();
            for i in 0..(5 * 60) {
                engine.append(cpu("a"), i * 60_000, 1.0).unwrap();
            }
            engine.maintain().unwrap();
        }
        let blocks_dir = temp_dir.path().join("blocks");
        let victim = block::list_block_dirs(&blocks_dir).unwrap()[0].clone();
        std::fs::write(victim.join("index"), b"garbage").unwrap();

        let engine = Engine::open(config(temp_dir.path())).unwrap();
        assert_eq!(engine.stats().metrics.blocks_quarantined, 1);
        assert!(blocks_dir.join(block::QUARANTINE_DIR).exists());
        // remaining data is still served
        assert!(!read_all(&engine, &cpu("a")).is_empty());
    }

    fn copy_dir(from: &std::path::Path, to: &std::path::Path) {
        std::fs::create_dir_all(to).unwrap();
        for entry in std::fs::read_dir(from).unwrap() {
            let entry = entry.unwrap();
            let target = to.join(entry.file_name());
            if entry.file_type().unwrap().is_dir() {
                copy_dir(&entry.path(), &target);
            } else {
                std::fs::copy(entry.path(), &target).unwrap();
            }
        }
    }

    #[test]
    fn test_delete_racing_maintenance_is_kept() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Arc::new(Engine::open(config(temp_dir.path())).unwrap());
        for i in 0..(10 * 60) {
            engine
                .append_batch(vec![(cpu("a"), i * 60_000, 1.0), (cpu("b"), i * 60_000, 1.0)])
                .unwrap();
        }

        // one pass cuts over, flushes four blocks and compacts three of them
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let maintenance = {
            let engine = engine.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                engine.maintain().unwrap()
            })
        };
        barrier.wait();
        engine.delete_series(&[Matcher::equal("host", "a")], 0, 8 * H).unwrap();
        let report = maintenance.join().unwrap();
        assert!(report.cutover);

        let check = |engine: &Engine| {
            let a = read_all(engine, &cpu("a"));
            assert_eq!(a.len(), 119);
            assert!(a.iter().all(|s| s.t > 8 * H));
            assert_eq!(read_all(engine, &cpu("b")).len(), 600);
        };
        check(&engine);
        engine.maintain().unwrap();
        check(&engine);
        drop(engine);

        let engine = Engine::open(config(temp_dir.path())).unwrap();
        check(&engine);
    }

    #[test]
    fn test_interrupted_compaction_cleaned_on_open() {
        let temp_dir = TempDir::new().unwrap();
        let backup = TempDir::new().unwrap();
        let blocks_dir = temp_dir.path().join("blocks");
        let append_until = |engine: &Engine, from: i64, to: i64| {
            for i in from..to {
                engine.append(cpu("a"), i * 60_000, i as f64).unwrap();
                if i % 60 == 0 {
                    engine.maintain().unwrap();
                }
            }
        };

        let before;
        let saved;
        {
            let engine = Engine::open(config(temp_dir.path())).unwrap();
            append_until(&engine, 0, 400);
            assert_eq!(engine.blocks().len(), 2);
            assert_eq!(engine.stats().metrics.compactions, 0);
            saved = block::list_block_dirs(&blocks_dir).unwrap();
            for dir in &saved {
                copy_dir(dir, &backup.path().join(dir.file_name().unwrap()));
            }

            append_until(&engine, 400, 480);
            assert_eq!(engine.stats().metrics.compactions, 1);
            before = read_all(&engine, &cpu("a"));
        }

        // as if the process died before removing the merged inputs
        for dir in &saved {
            assert!(!dir.exists());
            copy_dir(&backup.path().join(dir.file_name().unwrap()), dir);
        }

        let engine = Engine::open(config(temp_dir.path())).unwrap();
        for dir in &saved {
            assert!(!dir.exists(), "{:?} should have been removed", dir);
        }
        let blocks = engine.blocks();
        assert!(blocks.windows(2).all(|w| w[0].max_time <= w[1].min_time));
        assert!(blocks.iter().any(|b| b.min_time == 0 && b.max_time == 6 * H));
        assert_eq!(read_all(&engine, &cpu("a")), before);
    }

    #[test]
    fn test_inactive_series_leave_the_index() {
        let temp_dir = TempDir::new().unwrap();
        let engine = Engine::open(config(temp_dir.path())).unwrap();
        for i in 0..(5 * 60) {
            let mut batch = vec![(cpu("a"), i * 60_000, 1.0)];
            if i < 60 {
                batch.push((cpu("old"), i * 60_000, 1.0));
            }
            engine.append_batch(batch).unwrap();
        }

        // an open querier keeps the head it was taken from readable
        let querier = engine.querier();
        let report = engine.maintain().unwrap();
        assert!(report.cutover);
        assert_eq!(report.series_removed, 0);
        let old = querier.select(&[Matcher::equal("host", "old")], Timestamp::MIN, Timestamp::MAX);
        assert_eq!(old[0].iter().count(), 60);
        drop(old);
        drop(querier);

        let report = engine.maintain().unwrap();
        assert_eq!(report.series_removed, 1);
        assert_eq!(engine.stats().num_series, 1);
        assert_eq!(engine.stats().metrics.series_removed, 1);
        assert_eq!(engine.index().label_values("host"), vec!["a".to_string()]);

        // persisted samples are still served, and the series can return
        assert_eq!(read_all(&engine, &cpu("old")).len(), 60);
        let t = engine.stats().head_max_time.unwrap();
        engine.append(cpu("old"), t, 2.0).unwrap();
        assert_eq!(read_all(&engine, &cpu("old")).len(), 61);
        assert_eq!(engine.maintain().unwrap().series_removed, 0);
    }
}
