//! Block reader

use super::{
    chunk_file_path, BlockMeta, ChunkMeta, IndexEntry, Interval, Tombstones, CHUNK_FLAG_LZ4,
    INDEX_FILE, INDEX_MAGIC, TOMBSTONES_FILE,
};
use crate::compression::EncodedChunk;
use crate::index::Postings;
use crate::{Error, Labels, Matcher, Result, Sample};
use bytes::Buf;
use parking_lot::{Mutex, RwLock};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Read access to one persisted block.
///
/// The index is held in memory; chunk data is read from disk on demand.
pub struct BlockReader {
    dir: PathBuf,
    meta: BlockMeta,
    series: Vec<IndexEntry>,
    postings: Postings,
    files: Vec<Mutex<File>>,
    tombstones: RwLock<Arc<Tombstones>>,
    corrupt: AtomicBool,
    size_bytes: u64,
}

impl BlockReader {
    /// Open and verify a block directory
    pub fn open(dir: &Path) -> Result<Self> {
        let meta = BlockMeta::load(dir)?;
        let series = Self::read_index(&dir.join(INDEX_FILE))?;

        let mut postings = Postings::new();
        for (id, entry) in series.iter().enumerate() {
            postings.add(id as u32, &entry.labels);
        }

        let max_file = series
            .iter()
            .flat_map(|s| s.chunks.iter().map(|c| c.file))
            .max()
            .unwrap_or(0);
        let mut files = Vec::with_capacity(max_file as usize);
        let mut lengths = Vec::with_capacity(max_file as usize);
        for num in 1..=max_file {
            let file = File::open(chunk_file_path(dir, num))?;
            lengths.push(file.metadata()?.len());
            files.push(Mutex::new(file));
        }
        let size_bytes = lengths.iter().sum();
        for entry in &series {
            for chunk in &entry.chunks {
                let len = (chunk.file as usize)
                    .checked_sub(1)
                    .and_then(|i| lengths.get(i))
                    .copied()
                    .unwrap_or(0);
                if chunk.offset + chunk.len as u64 > len {
                    return Err(Error::Corruption(format!(
                        "chunk at {}:{} past end of segment in {:?}",
                        chunk.file, chunk.offset, dir
                    )));
                }
            }
        }

        let tombstones = Tombstones::load(&dir.join(TOMBSTONES_FILE))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            series,
            postings,
            files,
            tombstones: RwLock::new(Arc::new(tombstones)),
            corrupt: AtomicBool::new(false),
            size_bytes,
        })
    }

    fn read_index(path: &Path) -> Result<Vec<IndexEntry>> {
        let data = fs::read(path)?;
        if data.len() < INDEX_MAGIC.len() + 1 + 4 || &data[..4] != INDEX_MAGIC {
            return Err(Error::Corruption(format!("bad index header in {:?}", path)));
        }
        let (content, crc) = data.split_at(data.len() - 4);
        let expected = (&crc[..]).get_u32_le();
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        bincode::deserialize(&content[5..])
            .map_err(|e| Error::Corruption(format!("undecodable index {:?}: {}", path, e)))
    }

    pub fn meta(&self) -> &BlockMeta {
        &self.meta
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn num_series(&self) -> usize {
        self.series.len()
    }

    pub fn series(&self, id: u32) -> Option<&IndexEntry> {
        self.series.get(id as usize)
    }

    /// Series matching every matcher, by block-local id
    pub fn select(&self, matchers: &[Matcher]) -> Vec<(u32, &IndexEntry)> {
        self.postings
            .select(matchers)
            .iter()
            .filter_map(|id| self.series.get(id as usize).map(|e| (id, e)))
            .collect()
    }

    pub fn label_names(&self) -> Vec<String> {
        self.postings.label_names()
    }

    pub fn label_values(&self, name: &str) -> Vec<String> {
        self.postings.label_values(name)
    }

    /// Read and verify one chunk
    pub fn read_chunk(&self, meta: &ChunkMeta) -> Result<Arc<EncodedChunk>> {
        let result = self.read_chunk_inner(meta);
        if let Err(e) = &result {
            if !self.corrupt.swap(true, Ordering::SeqCst) {
                warn!("Block {:?} is corrupt: {}", self.dir, e);
            }
        }
        result
    }

    fn read_chunk_inner(&self, meta: &ChunkMeta) -> Result<Arc<EncodedChunk>> {
        let file = self
            .files
            .get((meta.file as usize).wrapping_sub(1))
            .ok_or_else(|| Error::Corruption(format!("missing chunk segment {}", meta.file)))?;
        let mut buf = vec![0u8; meta.len as usize];
        {
            let mut file = file.lock();
            file.seek(SeekFrom::Start(meta.offset))?;
            file.read_exact(&mut buf)?;
        }
        if buf.len() < 9 {
            return Err(Error::Corruption("chunk entry too short".into()));
        }
        let payload_len = (&buf[..4]).get_u32_le() as usize;
        if payload_len + 9 != buf.len() {
            return Err(Error::Corruption(format!(
                "chunk length {} does not match entry size {}",
                payload_len,
                buf.len()
            )));
        }
        let (content, crc) = buf[4..].split_at(1 + payload_len);
        let expected = (&crc[..]).get_u32_le();
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }
        let chunk = EncodedChunk::from_bytes(&content[1..], content[0] & CHUNK_FLAG_LZ4 != 0)?;
        Ok(Arc::new(chunk))
    }

    /// Every sample of a series, ignoring tombstones
    pub fn series_samples(&self, id: u32) -> Result<Vec<Sample>> {
        let Some(entry) = self.series.get(id as usize) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for chunk in &entry.chunks {
            out.extend(self.read_chunk(chunk)?.samples()?);
        }
        Ok(out)
    }

    pub fn tombstones(&self) -> Arc<Tombstones> {
        self.tombstones.read().clone()
    }

    /// Record deletions for the given series and persist them
    pub fn add_tombstones(&self, ids: &[u32], interval: Interval) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut guard = self.tombstones.write();
        let mut updated = (**guard).clone();
        for id in ids {
            updated.add(*id, interval);
        }
        updated.save(&self.dir.join(TOMBSTONES_FILE))?;
        *guard = Arc::new(updated);
        Ok(())
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::SeqCst)
    }

    pub fn mark_corrupt(&self) {
        self.corrupt.store(true, Ordering::SeqCst);
    }

    pub fn labels_of(&self, id: u32) -> Option<&Labels> {
        self.series.get(id as usize).map(|e| &e.labels)
    }
}

impl std::fmt::Debug for BlockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockReader")
            .field("dir", &self.dir)
            .field("meta", &self.meta)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockWriter;
    use crate::compression::CompressionConfig;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_block(dir: &Path, lz4: bool) -> PathBuf {
        let config = CompressionConfig {
            samples_per_chunk: 10,
            use_lz4: lz4,
        };
        let mut writer = BlockWriter::new(dir, 0, 1000, 1, vec![], config).unwrap();
        let a = Labels::from_pairs(&[("__name__", "cpu"), ("host", "a")]);
        let b = Labels::from_pairs(&[("__name__", "cpu"), ("host", "b")]);
        let samples: Vec<Sample> = (0..25).map(|i| Sample::new(i * 10, i as f64)).collect();
        writer.add_series(&b, &samples[..5]).unwrap();
        writer.add_series(&a, &samples).unwrap();
        writer.finish().unwrap().1
    }

    #[test]
    fn test_write_and_read_block() {
        let temp_dir = TempDir::new().unwrap();
        for lz4 in [false, true] {
            let sub = temp_dir.path().join(format!("lz4-{}", lz4));
            fs::create_dir_all(&sub).unwrap();
            let block_dir = write_block(&sub, lz4);
            let reader = BlockReader::open(&block_dir).unwrap();

            assert_eq!(reader.num_series(), 2);
            assert_eq!(reader.meta().stats.num_samples, 30);
            assert_eq!(reader.meta().stats.num_chunks, 4);

            let hits = reader.select(&[Matcher::equal("host", "a")]);
            assert_eq!(hits.len(), 1);
            let (id, entry) = hits[0];
            assert_eq!(entry.chunks.len(), 3);
            let samples = reader.series_samples(id).unwrap();
            assert_eq!(samples.len(), 25);
            assert_eq!(samples[24], Sample::new(240, 24.0));
            assert_eq!(reader.label_values("host"), vec!["a", "b"]);
        }
    }

    #[test]
    fn test_corrupt_chunk_is_detected() {
        let temp_dir = TempDir::new().unwrap();
        let block_dir = write_block(temp_dir.path(), false);
        let path = chunk_file_path(&block_dir, 1);
        let mut data = fs::read(&path).unwrap();
        // last entry belongs to host=a
        let n = data.len();
        data[n - 6] ^= 0xFF;
        fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let reader = BlockReader::open(&block_dir).unwrap();
        let id = reader.select(&[Matcher::equal("host", "a")])[0].0;
        assert!(reader.series_samples(id).is_err());
        assert!(reader.is_corrupt());
    }

    #[test]
    fn test_truncated_index_fails_open() {
        let temp_dir = TempDir::new().unwrap();
        let block_dir = write_block(temp_dir.path(), true);
        let index = block_dir.join(INDEX_FILE);
        let data = fs::read(&index).unwrap();
        fs::write(&index, &data[..data.len() / 2]).unwrap();
        assert!(BlockReader::open(&block_dir).is_err());
    }

    #[test]
    fn test_tombstones_persist() {
        let temp_dir = TempDir::new().unwrap();
        let block_dir = write_block(temp_dir.path(), true);
        {
            let reader = BlockReader::open(&block_dir).unwrap();
            reader.add_tombstones(&[0], Interval::new(0, 50)).unwrap();
        }
        let reader = BlockReader::open(&block_dir).unwrap();
        assert!(reader.tombstones().is_deleted(0, 50));
        assert!(!reader.tombstones().is_deleted(0, 60));
    }
}
