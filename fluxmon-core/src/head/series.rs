//! In-memory series with chunked samples

use crate::compression::{ChunkEncoder, ChunkIter, EncodedChunk};
use crate::{Labels, Result, Sample, SeriesRef, Timestamp};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One series held by the head block
pub struct MemSeries {
    series_ref: SeriesRef,
    labels: Labels,
    chunks: Mutex<SeriesChunks>,
    /// Samples visible to new queries
    published: AtomicUsize,
}

/// Chunk state guarded by the series lock
pub struct SeriesChunks {
    closed: Vec<Arc<EncodedChunk>>,
    open: ChunkEncoder,
    last_t: Option<Timestamp>,
    total: usize,
    samples_per_chunk: usize,
}

impl SeriesChunks {
    pub fn last_t(&self) -> Option<Timestamp> {
        self.last_t
    }

    pub fn len(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Append a sample already checked for ordering
    pub fn append(&mut self, t: Timestamp, v: f64) {
        if self.open.len() >= self.samples_per_chunk {
            let full = std::mem::take(&mut self.open);
            self.closed.push(Arc::new(full.finish()));
        }
        self.open.append(t, v);
        self.last_t = Some(t);
        self.total += 1;
    }
}

impl MemSeries {
    pub fn new(series_ref: SeriesRef, labels: Labels, samples_per_chunk: usize) -> Self {
        Self {
            series_ref,
            labels,
            chunks: Mutex::new(SeriesChunks {
                closed: Vec::new(),
                open: ChunkEncoder::new(),
                last_t: None,
                total: 0,
                samples_per_chunk: samples_per_chunk.max(1),
            }),
            published: AtomicUsize::new(0),
        }
    }

    pub fn series_ref(&self) -> SeriesRef {
        self.series_ref
    }

    pub fn labels(&self) -> &Labels {
        &self.labels
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SeriesChunks> {
        self.chunks.lock()
    }

    /// Make everything appended so far visible to new readers
    pub(crate) fn publish(&self, chunks: &SeriesChunks) {
        self.published.store(chunks.total, Ordering::Release);
    }

    pub fn published(&self) -> usize {
        self.published.load(Ordering::Acquire)
    }

    pub fn last_t(&self) -> Option<Timestamp> {
        self.chunks.lock().last_t
    }

    /// Chunks holding the first `limit` samples, each with its sample limit.
    ///
    /// The open chunk is copied so later appends never reach the caller.
    pub fn chunks_upto(&self, limit: usize) -> Vec<(Arc<EncodedChunk>, usize)> {
        let guard = self.chunks.lock();
        let mut out = Vec::with_capacity(guard.closed.len() + 1);
        let mut remaining = limit;
        for chunk in &guard.closed {
            if remaining == 0 {
                return out;
            }
            let take = chunk.count.min(remaining);
            out.push((chunk.clone(), take));
            remaining -= take;
        }
        if remaining > 0 && !guard.open.is_empty() {
            let snapshot = Arc::new(guard.open.snapshot());
            let take = snapshot.count.min(remaining);
            out.push((snapshot, take));
        }
        out
    }

    /// All published samples
    pub fn samples(&self) -> Result<Vec<Sample>> {
        let mut out = Vec::with_capacity(self.published());
        for (chunk, limit) in self.chunks_upto(self.published()) {
            let mut iter = ChunkIter::with_limit(chunk, limit);
            out.extend(iter.by_ref());
            if iter.failed() {
                return Err(crate::Error::Compression(format!(
                    "failed to decode head chunk of {}",
                    self.labels
                )));
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for MemSeries {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemSeries")
            .field("ref", &self.series_ref)
            .field("labels", &self.labels)
            .field("published", &self.published())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_are_cut() {
        let series = MemSeries::new(0, Labels::from_pairs(&[("__name__", "x")]), 4);
        {
            let mut chunks = series.lock();
            for i in 0..10 {
                chunks.append(i * 1000, i as f64);
            }
            series.publish(&chunks);
        }
        let parts = series.chunks_upto(series.published());
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.iter().map(|(_, n)| n).sum::<usize>(), 10);
        assert_eq!(series.samples().unwrap().len(), 10);
        assert_eq!(series.last_t(), Some(9000));
    }

    #[test]
    fn test_unpublished_samples_hidden() {
        let series = MemSeries::new(0, Labels::from_pairs(&[("__name__", "x")]), 120);
        let mut chunks = series.lock();
        chunks.append(1, 1.0);
        series.publish(&chunks);
        chunks.append(2, 2.0);
        drop(chunks);

        let samples = series.samples().unwrap();
        assert_eq!(samples, vec![Sample::new(1, 1.0)]);
    }
}
