//! Read snapshots and lazy series iteration
//!
//! A [`Querier`] pins the head, any frozen heads waiting for flush and the
//! block list as they were when it was created. Later appends, cutovers
//! and compactions are invisible to it.

use crate::block::{is_deleted, BlockReader, ChunkMeta, Interval, Tombstones};
use crate::compression::{ChunkIter, EncodedChunk};
use crate::head::HeadSnapshot;
use crate::index::SeriesIndex;
use crate::{Labels, Matcher, Sample, Timestamp};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::warn;

type Warnings = Arc<Mutex<Vec<String>>>;

/// Consistent read view over the whole engine
pub struct Querier {
    index: Arc<SeriesIndex>,
    head: HeadSnapshot,
    /// Frozen heads with their exclusive upper bound
    frozen: Vec<(HeadSnapshot, Timestamp)>,
    blocks: Vec<(Arc<BlockReader>, Arc<Tombstones>)>,
    warnings: Warnings,
}

impl Querier {
    pub(crate) fn new(
        index: Arc<SeriesIndex>,
        head: HeadSnapshot,
        frozen: Vec<(HeadSnapshot, Timestamp)>,
        blocks: Vec<Arc<BlockReader>>,
    ) -> Self {
        let warnings: Warnings = Arc::new(Mutex::new(Vec::new()));
        let mut usable = Vec::with_capacity(blocks.len());
        for block in blocks {
            if block.is_corrupt() {
                warnings.lock().push(format!(
                    "block {} is corrupt and was excluded",
                    block.meta().id
                ));
                continue;
            }
            let tombstones = block.tombstones();
            usable.push((block, tombstones));
        }
        usable.sort_by_key(|(b, _)| (b.meta().min_time, b.meta().compaction.level));

        Self {
            index,
            head,
            frozen,
            blocks: usable,
            warnings,
        }
    }

    /// Series matching every matcher with samples in `[mint, maxt]`,
    /// sorted by label set.
    pub fn select(&self, matchers: &[Matcher], mint: Timestamp, maxt: Timestamp) -> Vec<Series> {
        let mut by_labels: BTreeMap<Labels, Vec<SourceCursor>> = BTreeMap::new();

        for (block, tombstones) in &self.blocks {
            if !block.meta().overlaps(mint, maxt) {
                continue;
            }
            for (id, entry) in block.select(matchers) {
                let chunks: Vec<ChunkRef> = entry
                    .chunks
                    .iter()
                    .filter(|c| c.max_t >= mint && c.min_t <= maxt)
                    .map(|c| ChunkRef::Disk(*c))
                    .collect();
                if chunks.is_empty() {
                    continue;
                }
                by_labels.entry(entry.labels.clone()).or_default().push(SourceCursor::new(
                    chunks,
                    tombstones.get(id).into(),
                    Timestamp::MAX,
                    Some(block.clone()),
                ));
            }
        }

        let refs = self.index.select(matchers);
        let heads = self
            .frozen
            .iter()
            .map(|(snap, upto)| (snap, *upto))
            .chain(std::iter::once((&self.head, Timestamp::MAX)));
        for (snap, upto) in heads {
            for (series_ref, labels) in &refs {
                let count = snap.count(*series_ref);
                if count == 0 {
                    continue;
                }
                let Some(series) = snap.head.get(*series_ref) else {
                    continue;
                };
                let chunks: Vec<ChunkRef> = series
                    .chunks_upto(count)
                    .into_iter()
                    .filter(|(c, _)| c.max_t >= mint && c.min_t <= maxt)
                    .map(|(c, n)| ChunkRef::Mem(c, n))
                    .collect();
                if chunks.is_empty() {
                    continue;
                }
                by_labels.entry(labels.clone()).or_default().push(SourceCursor::new(
                    chunks,
                    snap.tombstones.get(*series_ref).into(),
                    upto,
                    None,
                ));
            }
        }

        by_labels
            .into_iter()
            .map(|(labels, sources)| Series {
                labels,
                sources,
                mint,
                maxt,
                warnings: self.warnings.clone(),
            })
            .collect()
    }

    /// Label sets of matching series with data in the range
    pub fn series(&self, matchers: &[Matcher], mint: Timestamp, maxt: Timestamp) -> Vec<Labels> {
        self.select(matchers, mint, maxt)
            .into_iter()
            .filter(|s| s.iter().next().is_some())
            .map(|s| s.labels)
            .collect()
    }

    pub fn label_names(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.index.label_names().into_iter().collect();
        for (block, _) in &self.blocks {
            names.extend(block.label_names());
        }
        names.into_iter().collect()
    }

    pub fn label_values(&self, name: &str) -> Vec<String> {
        let mut values: BTreeSet<String> = self.index.label_values(name).into_iter().collect();
        for (block, _) in &self.blocks {
            values.extend(block.label_values(name));
        }
        values.into_iter().collect()
    }

    /// Problems met while reading, such as corrupt blocks
    pub fn warnings(&self) -> Vec<String> {
        self.warnings.lock().clone()
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// One selected series; iterate it as often as needed
#[derive(Clone)]
pub struct Series {
    pub labels: Labels,
    sources: Vec<SourceCursor>,
    mint: Timestamp,
    maxt: Timestamp,
    warnings: Warnings,
}

impl Series {
    /// Fresh forward iterator over the series' samples in time order
    pub fn iter(&self) -> SeriesIterator {
        SeriesIterator {
            sources: self.sources.clone(),
            peeked: Vec::new(),
            started: false,
            mint: self.mint,
            maxt: self.maxt,
            warnings: self.warnings.clone(),
        }
    }
}

impl std::fmt::Debug for Series {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Series")
            .field("labels", &self.labels)
            .field("sources", &self.sources.len())
            .finish()
    }
}

#[derive(Clone)]
enum ChunkRef {
    /// Head chunk with the number of visible samples
    Mem(Arc<EncodedChunk>, usize),
    Disk(ChunkMeta),
}

/// Sequential cursor over the chunks of one series in one source
#[derive(Clone)]
struct SourceCursor {
    chunks: Arc<[ChunkRef]>,
    next_chunk: usize,
    current: Option<ChunkIter>,
    tombstones: Arc<[Interval]>,
    upto: Timestamp,
    block: Option<Arc<BlockReader>>,
    done: bool,
}

impl SourceCursor {
    fn new(
        chunks: Vec<ChunkRef>,
        tombstones: Arc<[Interval]>,
        upto: Timestamp,
        block: Option<Arc<BlockReader>>,
    ) -> Self {
        Self {
            chunks: chunks.into(),
            next_chunk: 0,
            current: None,
            tombstones,
            upto,
            block,
            done: false,
        }
    }

    fn finish(&mut self) -> Option<Sample> {
        self.done = true;
        self.current = None;
        None
    }

    fn next(&mut self, mint: Timestamp, maxt: Timestamp, warnings: &Warnings) -> Option<Sample> {
        while !self.done {
            if let Some(iter) = self.current.as_mut() {
                match iter.next() {
                    Some(s) if s.t < mint || is_deleted(&self.tombstones, s.t) => continue,
                    Some(s) if s.t > maxt || s.t >= self.upto => return self.finish(),
                    Some(s) => return Some(s),
                    None if iter.failed() => {
                        warnings.lock().push("failed to decode chunk; series truncated".into());
                        return self.finish();
                    }
                    None => self.current = None,
                }
            }

            let Some(chunk) = self.chunks.get(self.next_chunk).cloned() else {
                return self.finish();
            };
            self.next_chunk += 1;
            match chunk {
                ChunkRef::Mem(c, limit) => {
                    if c.min_t > maxt {
                        return self.finish();
                    }
                    self.current = Some(ChunkIter::with_limit(c, limit));
                }
                ChunkRef::Disk(meta) => {
                    if meta.min_t > maxt {
                        return self.finish();
                    }
                    let Some(block) = self.block.as_ref() else {
                        return self.finish();
                    };
                    match block.read_chunk(&meta) {
                        Ok(c) => self.current = Some(ChunkIter::new(c)),
                        Err(e) => {
                            warn!("Skipping unreadable chunk in block {}: {}", block.meta().id, e);
                            warnings.lock().push(format!(
                                "block {} is corrupt, results may be partial: {}",
                                block.meta().id,
                                e
                            ));
                            return self.finish();
                        }
                    }
                }
            }
        }
        None
    }
}

/// Merges the sources of one series in time order.
///
/// Where sources overlap on a timestamp the newest source wins. Cloning
/// the iterator yields an independent cursor at the same position.
#[derive(Clone)]
pub struct SeriesIterator {
    sources: Vec<SourceCursor>,
    peeked: Vec<Option<Sample>>,
    started: bool,
    mint: Timestamp,
    maxt: Timestamp,
    warnings: Warnings,
}

impl Iterator for SeriesIterator {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if !self.started {
            self.started = true;
            let (mint, maxt) = (self.mint, self.maxt);
            let warnings = self.warnings.clone();
            self.peeked = self
                .sources
                .iter_mut()
                .map(|s| s.next(mint, maxt, &warnings))
                .collect();
        }

        let min_t = self.peeked.iter().flatten().map(|s| s.t).min()?;
        let mut chosen = None;
        for (i, slot) in self.peeked.iter_mut().enumerate() {
            if let Some(s) = slot {
                if s.t == min_t {
                    chosen = Some(*s);
                    *slot = self.sources[i].next(self.mint, self.maxt, &self.warnings);
                }
            }
        }
        chosen
    }
}
