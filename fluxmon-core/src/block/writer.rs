//! Block writer

use super::{
    chunk_file_path, sync_dir, BlockMeta, BlockStats, ChunkMeta, CompactionMeta, IndexEntry,
    CHUNKS_DIR, CHUNK_FLAG_LZ4, INDEX_FILE, INDEX_MAGIC, INDEX_VERSION, META_FILE, TMP_SUFFIX,
};
use crate::compression::{CompressionConfig, EncodedChunk};
use crate::{Error, Labels, Result, Sample, Timestamp};
use bytes::{BufMut, BytesMut};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Builds one block in a temporary directory
pub struct BlockWriter {
    blocks_dir: PathBuf,
    tmp_dir: PathBuf,
    meta: BlockMeta,
    config: CompressionConfig,
    segment_size: u64,

    // Current chunk segment
    chunk_file: BufWriter<File>,
    file_num: u32,
    offset: u64,

    entries: Vec<IndexEntry>,
}

impl BlockWriter {
    /// Start a block for `[min_time, max_time)`
    pub fn new(
        blocks_dir: &Path,
        min_time: Timestamp,
        max_time: Timestamp,
        level: u32,
        sources: Vec<String>,
        config: CompressionConfig,
    ) -> Result<Self> {
        let meta = BlockMeta {
            id: uuid::Uuid::new_v4().to_string(),
            min_time,
            max_time,
            stats: BlockStats::default(),
            compaction: CompactionMeta { level, sources },
            version: INDEX_VERSION as u32,
        };
        let tmp_dir = blocks_dir.join(format!("{}{}", meta.dir_name(), TMP_SUFFIX));
        fs::create_dir_all(tmp_dir.join(CHUNKS_DIR))?;
        let chunk_file = BufWriter::new(File::create(chunk_file_path(&tmp_dir, 1))?);

        Ok(Self {
            blocks_dir: blocks_dir.to_path_buf(),
            tmp_dir,
            meta,
            config,
            segment_size: crate::config::CHUNK_SEGMENT_SIZE,
            chunk_file,
            file_num: 1,
            offset: 0,
            entries: Vec::new(),
        })
    }

    /// Override the chunk segment size
    pub fn with_segment_size(mut self, size: u64) -> Self {
        self.segment_size = size;
        self
    }

    /// Add one series. Samples must be sorted by time; empty series are skipped.
    pub fn add_series(&mut self, labels: &Labels, samples: &[Sample]) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }
        let mut chunks = Vec::with_capacity(samples.len() / self.config.samples_per_chunk + 1);
        for run in samples.chunks(self.config.samples_per_chunk.max(1)) {
            let chunk = EncodedChunk::from_samples(run);
            chunks.push(self.write_chunk(&chunk)?);
        }

        self.meta.stats.num_series += 1;
        self.meta.stats.num_samples += samples.len() as u64;
        self.meta.stats.num_chunks += chunks.len() as u64;
        self.entries.push(IndexEntry {
            labels: labels.clone(),
            chunks,
        });
        Ok(())
    }

    pub fn num_series(&self) -> usize {
        self.entries.len()
    }

    /// Frame: `[u32 payload len][u8 flags][payload][u32 crc of flags and payload]`
    fn write_chunk(&mut self, chunk: &EncodedChunk) -> Result<ChunkMeta> {
        let payload = chunk.to_bytes(self.config.use_lz4);
        let flags = if self.config.use_lz4 { CHUNK_FLAG_LZ4 } else { 0 };

        let mut buf = BytesMut::with_capacity(payload.len() + 9);
        buf.put_u32_le(payload.len() as u32);
        buf.put_u8(flags);
        buf.put_slice(&payload);
        let crc = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(crc);

        if self.offset > 0 && self.offset + buf.len() as u64 > self.segment_size {
            self.cut_segment()?;
        }

        let meta = ChunkMeta {
            min_t: chunk.min_t,
            max_t: chunk.max_t,
            file: self.file_num,
            offset: self.offset,
            len: buf.len() as u32,
        };
        self.chunk_file.write_all(&buf)?;
        self.offset += buf.len() as u64;
        Ok(meta)
    }

    fn cut_segment(&mut self) -> Result<()> {
        self.chunk_file.flush()?;
        self.chunk_file.get_ref().sync_all()?;
        self.file_num += 1;
        self.chunk_file = BufWriter::new(File::create(chunk_file_path(&self.tmp_dir, self.file_num))?);
        self.offset = 0;
        Ok(())
    }

    /// Write index and metadata, sync everything and move the block into place
    pub fn finish(mut self) -> Result<(BlockMeta, PathBuf)> {
        self.chunk_file.flush()?;
        self.chunk_file.get_ref().sync_all()?;

        self.entries.sort_by(|a, b| a.labels.cmp(&b.labels));
        self.write_index()?;

        let meta_json = serde_json::to_vec_pretty(&self.meta)
            .map_err(|e| Error::Internal(format!("failed to encode block meta: {}", e)))?;
        let meta_path = self.tmp_dir.join(META_FILE);
        fs::write(&meta_path, meta_json)?;
        File::open(&meta_path)?.sync_all()?;

        sync_dir(&self.tmp_dir.join(CHUNKS_DIR))?;
        sync_dir(&self.tmp_dir)?;

        let final_dir = self.blocks_dir.join(self.meta.dir_name());
        fs::rename(&self.tmp_dir, &final_dir)?;
        sync_dir(&self.blocks_dir)?;

        debug!(
            "Wrote block {} [{}, {}) with {} series",
            self.meta.id, self.meta.min_time, self.meta.max_time, self.meta.stats.num_series
        );
        Ok((self.meta, final_dir))
    }

    /// Drop the temporary directory without publishing the block
    pub fn abort(self) -> Result<()> {
        drop(self.chunk_file);
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        Ok(())
    }

    /// Index layout: `[magic][u8 version][bincode entries][u32 crc]`
    fn write_index(&self) -> Result<()> {
        let body = bincode::serialize(&self.entries)
            .map_err(|e| Error::Internal(format!("failed to encode block index: {}", e)))?;
        let mut buf = BytesMut::with_capacity(body.len() + 9);
        buf.put_slice(INDEX_MAGIC);
        buf.put_u8(INDEX_VERSION);
        buf.put_slice(&body);
        let crc = crc32fast::hash(&buf);
        buf.put_u32_le(crc);

        let path = self.tmp_dir.join(INDEX_FILE);
        let mut file = File::create(&path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }
}
