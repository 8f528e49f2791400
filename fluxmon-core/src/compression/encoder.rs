//! Gorilla-style chunk encoder
//!
//! Timestamps are stored as delta-of-delta with four bucket widths sized
//! for millisecond scrape intervals; values are XORed against their
//! predecessor and only the meaningful bits are written.

use super::bitstream::BitWriter;
use super::EncodedChunk;
use crate::Timestamp;

/// Sentinel forcing a fresh leading/trailing window on the first XOR
pub(super) const NO_WINDOW: u32 = u32::MAX;

/// Delta-of-delta buckets: (prefix, prefix bits, payload bits)
pub(super) const DOD_BUCKETS: [(u64, u32, u32); 3] = [(0b10, 2, 14), (0b110, 3, 17), (0b1110, 4, 20)];

/// Incremental encoder for one chunk
#[derive(Debug, Clone)]
pub struct ChunkEncoder {
    writer: BitWriter,
    count: usize,
    min_t: Timestamp,
    prev_t: Timestamp,
    prev_delta: i64,
    prev_bits: u64,
    leading: u32,
    trailing: u32,
}

impl ChunkEncoder {
    pub fn new() -> Self {
        Self {
            writer: BitWriter::with_capacity(256),
            count: 0,
            min_t: 0,
            prev_t: 0,
            prev_delta: 0,
            prev_bits: 0,
            leading: NO_WINDOW,
            trailing: 0,
        }
    }

    /// Append a sample; callers guarantee strictly increasing timestamps
    pub fn append(&mut self, t: Timestamp, v: f64) {
        if self.count == 0 {
            self.min_t = t;
            self.prev_t = t;
            self.writer.write_bits(t as u64, 64);
            self.prev_bits = v.to_bits();
            self.writer.write_bits(self.prev_bits, 64);
        } else {
            self.append_timestamp(t);
            self.append_value(v);
        }
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn max_time(&self) -> Timestamp {
        self.prev_t
    }

    /// Copy of the bytes written so far; the encoder stays usable
    pub fn snapshot(&self) -> EncodedChunk {
        EncodedChunk {
            data: self.writer.bytes().to_vec(),
            count: self.count,
            min_t: self.min_t,
            max_t: self.prev_t,
        }
    }

    pub fn finish(self) -> EncodedChunk {
        EncodedChunk {
            count: self.count,
            min_t: self.min_t,
            max_t: self.prev_t,
            data: self.writer.finish(),
        }
    }

    fn append_timestamp(&mut self, t: Timestamp) {
        let delta = t - self.prev_t;
        let dod = delta - self.prev_delta;

        if dod == 0 {
            self.writer.write_bit(false);
        } else {
            let bucket = DOD_BUCKETS.iter().find(|(_, _, bits)| {
                let bias = (1i64 << (bits - 1)) - 1;
                dod >= -bias && dod <= bias + 1
            });
            match bucket {
                Some(&(prefix, prefix_bits, bits)) => {
                    let bias = (1i64 << (bits - 1)) - 1;
                    self.writer.write_bits(prefix, prefix_bits);
                    self.writer.write_bits((dod + bias) as u64, bits);
                }
                None => {
                    self.writer.write_bits(0b1111, 4);
                    self.writer.write_bits(dod as u64, 64);
                }
            }
        }

        self.prev_delta = delta;
        self.prev_t = t;
    }

    fn append_value(&mut self, v: f64) {
        let bits = v.to_bits();
        let xor = bits ^ self.prev_bits;
        self.prev_bits = bits;

        if xor == 0 {
            self.writer.write_bit(false);
            return;
        }
        self.writer.write_bit(true);

        let leading = xor.leading_zeros().min(31);
        let trailing = xor.trailing_zeros();

        if self.leading != NO_WINDOW && leading >= self.leading && trailing >= self.trailing {
            self.writer.write_bit(false);
            let meaningful = 64 - self.leading - self.trailing;
            self.writer.write_bits(xor >> self.trailing, meaningful);
        } else {
            self.writer.write_bit(true);
            let meaningful = 64 - leading - trailing;
            self.writer.write_bits(leading as u64, 5);
            // 64 meaningful bits does not fit in 6 bits and is stored as 0
            self.writer.write_bits((meaningful % 64) as u64, 6);
            self.writer.write_bits(xor >> trailing, meaningful);
            self.leading = leading;
            self.trailing = trailing;
        }
    }
}

impl Default for ChunkEncoder {
    fn default() -> Self {
        Self::new()
    }
}
