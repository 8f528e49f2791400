//! Chunk encoding for time-series samples
//!
//! Samples of one series are packed into chunks using the scheme from
//! Facebook's "Gorilla: A Fast, Scalable, In-Memory Time Series Database":
//! delta-of-delta timestamps and XOR-compressed float values. Chunks on
//! disk may additionally be LZ4 compressed.

mod bitstream;
mod decoder;
mod encoder;

pub use bitstream::{BitCursor, BitWriter};
pub use decoder::ChunkIter;
pub use encoder::ChunkEncoder;

use crate::{Error, Result, Sample, Timestamp};
use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;

/// An immutable encoded chunk
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    /// Encoded bit stream
    pub data: Vec<u8>,
    /// Number of samples
    pub count: usize,
    /// First timestamp in chunk
    pub min_t: Timestamp,
    /// Last timestamp in chunk
    pub max_t: Timestamp,
}

impl EncodedChunk {
    /// Encode a run of samples into a single chunk
    pub fn from_samples(samples: &[Sample]) -> Self {
        let mut encoder = ChunkEncoder::new();
        for s in samples {
            encoder.append(s.t, s.v);
        }
        encoder.finish()
    }

    pub fn iter(self: &Arc<Self>) -> ChunkIter {
        ChunkIter::new(Arc::clone(self))
    }

    /// Decode every sample, failing on malformed data
    pub fn samples(self: &Arc<Self>) -> Result<Vec<Sample>> {
        let mut it = self.iter();
        let out: Vec<Sample> = it.by_ref().collect();
        if it.failed() || out.len() != self.count {
            return Err(Error::Compression(format!(
                "chunk decoded {} of {} samples",
                out.len(),
                self.count
            )));
        }
        Ok(out)
    }

    /// Serialize as `[u16 count][i64 min_t][i64 max_t][data]`, optionally LZ4 compressed
    pub fn to_bytes(&self, use_lz4: bool) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(18 + self.data.len());
        buf.put_u16_le(self.count as u16);
        buf.put_i64_le(self.min_t);
        buf.put_i64_le(self.max_t);
        buf.put_slice(&self.data);
        if use_lz4 {
            lz4_flex::compress_prepend_size(&buf)
        } else {
            buf.to_vec()
        }
    }

    pub fn from_bytes(data: &[u8], lz4: bool) -> Result<Self> {
        let owned;
        let raw: &[u8] = if lz4 {
            owned = lz4_flex::decompress_size_prepended(data)
                .map_err(|e| Error::Compression(e.to_string()))?;
            &owned
        } else {
            data
        };
        if raw.len() < 18 {
            return Err(Error::InvalidFormat("chunk header too short".into()));
        }
        let mut cursor = std::io::Cursor::new(raw);
        let count = cursor.get_u16_le() as usize;
        let min_t = cursor.get_i64_le();
        let max_t = cursor.get_i64_le();
        Ok(Self {
            data: raw[18..].to_vec(),
            count,
            min_t,
            max_t,
        })
    }
}

/// Chunk layout configuration
#[derive(Debug, Clone, Copy)]
pub struct CompressionConfig {
    /// Samples per chunk before a new one is cut
    pub samples_per_chunk: usize,
    /// Whether block chunks are LZ4 compressed on disk
    pub use_lz4: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            samples_per_chunk: crate::config::SAMPLES_PER_CHUNK,
            use_lz4: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_bytes_with_and_without_lz4() {
        let samples: Vec<Sample> = (0..100).map(|i| Sample::new(i * 15_000, (i % 7) as f64)).collect();
        let chunk = EncodedChunk::from_samples(&samples);
        for lz4 in [false, true] {
            let bytes = chunk.to_bytes(lz4);
            let back = Arc::new(EncodedChunk::from_bytes(&bytes, lz4).unwrap());
            assert_eq!(back.samples().unwrap(), samples);
            assert_eq!(back.min_t, 0);
            assert_eq!(back.max_t, 99 * 15_000);
        }
    }
}
