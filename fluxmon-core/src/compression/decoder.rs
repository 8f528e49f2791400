//! Chunk decoder

use super::bitstream::BitCursor;
use super::encoder::{DOD_BUCKETS, NO_WINDOW};
use super::EncodedChunk;
use crate::{Sample, Timestamp};
use std::sync::Arc;

/// Forward iterator over the samples of one chunk.
///
/// Owns an `Arc` of the chunk so it can outlive the lock that produced it,
/// and is `Clone` so a partially consumed iterator can be restarted from
/// the same position.
#[derive(Debug, Clone)]
pub struct ChunkIter {
    chunk: Arc<EncodedChunk>,
    cursor: BitCursor,
    limit: usize,
    read: usize,
    prev_t: Timestamp,
    prev_delta: i64,
    prev_bits: u64,
    leading: u32,
    trailing: u32,
    failed: bool,
}

impl ChunkIter {
    pub fn new(chunk: Arc<EncodedChunk>) -> Self {
        let limit = chunk.count;
        Self::with_limit(chunk, limit)
    }

    /// Iterate at most `limit` samples
    pub fn with_limit(chunk: Arc<EncodedChunk>, limit: usize) -> Self {
        let limit = limit.min(chunk.count);
        Self {
            chunk,
            cursor: BitCursor::new(),
            limit,
            read: 0,
            prev_t: 0,
            prev_delta: 0,
            prev_bits: 0,
            leading: NO_WINDOW,
            trailing: 0,
            failed: false,
        }
    }

    /// True if decoding stopped on malformed data
    pub fn failed(&self) -> bool {
        self.failed
    }

    fn decode_next(&mut self) -> Option<Sample> {
        let data: &[u8] = &self.chunk.data;
        if self.read == 0 {
            let t = self.cursor.read_bits(data, 64)? as i64;
            let bits = self.cursor.read_bits(data, 64)?;
            self.prev_t = t;
            self.prev_bits = bits;
            return Some(Sample::new(t, f64::from_bits(bits)));
        }

        let mut cursor = self.cursor;
        let dod = if !cursor.read_bit(data)? {
            0
        } else {
            let mut decoded = None;
            // the prefix is a run of ones terminated by a zero
            for &(_, _, bits) in DOD_BUCKETS.iter() {
                if !cursor.read_bit(data)? {
                    let bias = (1i64 << (bits - 1)) - 1;
                    decoded = Some(cursor.read_bits(data, bits)? as i64 - bias);
                    break;
                }
            }
            match decoded {
                Some(dod) => dod,
                None => cursor.read_bits(data, 64)? as i64,
            }
        };
        let delta = self.prev_delta + dod;
        let t = self.prev_t + delta;

        let bits = if !cursor.read_bit(data)? {
            self.prev_bits
        } else {
            let (leading, meaningful) = if !cursor.read_bit(data)? {
                if self.leading == NO_WINDOW {
                    return None;
                }
                (self.leading, 64 - self.leading - self.trailing)
            } else {
                let leading = cursor.read_bits(data, 5)? as u32;
                let mut meaningful = cursor.read_bits(data, 6)? as u32;
                if meaningful == 0 {
                    meaningful = 64;
                }
                if leading + meaningful > 64 {
                    return None;
                }
                self.leading = leading;
                self.trailing = 64 - leading - meaningful;
                (leading, meaningful)
            };
            let trailing = 64 - leading - meaningful;
            let value = cursor.read_bits(data, meaningful)?;
            self.prev_bits ^ (value << trailing)
        };

        self.cursor = cursor;
        self.prev_delta = delta;
        self.prev_t = t;
        self.prev_bits = bits;
        Some(Sample::new(t, f64::from_bits(bits)))
    }
}

impl Iterator for ChunkIter {
    type Item = Sample;

    fn next(&mut self) -> Option<Sample> {
        if self.read >= self.limit || self.failed {
            return None;
        }
        match self.decode_next() {
            Some(sample) => {
                self.read += 1;
                Some(sample)
            }
            None => {
                self.failed = true;
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.limit - self.read;
        (0, Some(left))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::ChunkEncoder;

    fn encode(samples: &[(i64, f64)]) -> Arc<EncodedChunk> {
        let mut encoder = ChunkEncoder::new();
        for (t, v) in samples {
            encoder.append(*t, *v);
        }
        Arc::new(encoder.finish())
    }

    #[test]
    fn test_irregular_timestamps_and_values() {
        let samples: Vec<(i64, f64)> = vec![
            (0, 10.0),
            (15_000, 15.0),
            (30_001, 15.0),
            (45_000, -3.25),
            (45_001, f64::MAX),
            (10_000_000, 0.0),
            (10_000_500, f64::NAN),
            (20_000_000_000, 1e-300),
            (20_000_000_001, 42.0),
        ];
        let decoded: Vec<Sample> = ChunkIter::new(encode(&samples)).collect();
        assert_eq!(decoded.len(), samples.len());
        for (d, (t, v)) in decoded.iter().zip(samples.iter()) {
            assert_eq!(d.t, *t);
            assert_eq!(d.v.to_bits(), v.to_bits());
        }
    }

    #[test]
    fn test_limit_truncates() {
        let chunk = encode(&[(1, 1.0), (2, 2.0), (3, 3.0)]);
        let decoded: Vec<Sample> = ChunkIter::with_limit(chunk, 2).collect();
        assert_eq!(decoded, vec![Sample::new(1, 1.0), Sample::new(2, 2.0)]);
    }

    #[test]
    fn test_clone_restarts_from_position() {
        let chunk = encode(&[(1, 1.0), (2, 2.0), (3, 3.0)]);
        let mut it = ChunkIter::new(chunk);
        it.next();
        let rest: Vec<Sample> = it.clone().collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(it.next(), Some(Sample::new(2, 2.0)));
    }

    #[test]
    fn test_truncated_data_fails() {
        let chunk = encode(&[(1, 1.0), (2, 7.5), (3, -3.0)]);
        let mut broken = (*chunk).clone();
        broken.data.truncate(17);
        let mut it = ChunkIter::new(Arc::new(broken));
        assert!(it.next().is_some());
        while it.next().is_some() {}
        assert!(it.failed());
    }
}
