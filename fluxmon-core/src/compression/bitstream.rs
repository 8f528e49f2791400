//! Bit-level I/O for chunk encoding

/// Append-only bit buffer, most significant bit first
#[derive(Debug, Clone, Default)]
pub struct BitWriter {
    buffer: Vec<u8>,
    bits: usize,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(bytes: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(bytes),
            bits: 0,
        }
    }

    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(bit as u64, 1);
    }

    /// Write the low `num_bits` bits of `value`
    #[inline]
    pub fn write_bits(&mut self, value: u64, num_bits: u32) {
        debug_assert!(num_bits <= 64);
        let mut remaining = num_bits;
        while remaining > 0 {
            let used = (self.bits % 8) as u32;
            if used == 0 {
                self.buffer.push(0);
            }
            let free = 8 - used;
            let take = free.min(remaining);
            let shift = remaining - take;
            let chunk = ((value >> shift) & ((1u64 << take) - 1)) as u8;
            let last = self.buffer.len() - 1;
            self.buffer[last] |= chunk << (free - take);
            self.bits += take as usize;
            remaining -= take;
        }
    }

    /// Bytes written so far, including a partially filled last byte
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn finish(self) -> Vec<u8> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }
}

/// Read position into a bit buffer.
///
/// The cursor does not borrow the buffer, so a decoder can own its data
/// (behind an `Arc`) and still be cheaply cloned.
#[derive(Debug, Clone, Copy, Default)]
pub struct BitCursor {
    pos: usize,
}

impl BitCursor {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn read_bit(&mut self, data: &[u8]) -> Option<bool> {
        self.read_bits(data, 1).map(|b| b == 1)
    }

    #[inline]
    pub fn read_bits(&mut self, data: &[u8], num_bits: u32) -> Option<u64> {
        debug_assert!(num_bits <= 64);
        let mut value = 0u64;
        let mut remaining = num_bits;
        while remaining > 0 {
            let byte = *data.get(self.pos / 8)? as u64;
            let avail = 8 - (self.pos % 8) as u32;
            let take = avail.min(remaining);
            let bits = (byte >> (avail - take)) & ((1u64 << take) - 1);
            value = (value << take) | bits;
            self.pos += take as usize;
            remaining -= take;
        }
        Some(value)
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_widths() {
        let mut writer = BitWriter::new();
        writer.write_bit(true);
        writer.write_bits(0b10101, 5);
        writer.write_bits(0xABCD, 16);
        writer.write_bits(u64::MAX, 64);
        writer.write_bits(0, 3);
        writer.write_bits(0xDEADBEEF, 32);
        let data = writer.finish();

        let mut cursor = BitCursor::new();
        assert_eq!(cursor.read_bit(&data), Some(true));
        assert_eq!(cursor.read_bits(&data, 5), Some(0b10101));
        assert_eq!(cursor.read_bits(&data, 16), Some(0xABCD));
        assert_eq!(cursor.read_bits(&data, 64), Some(u64::MAX));
        assert_eq!(cursor.read_bits(&data, 3), Some(0));
        assert_eq!(cursor.read_bits(&data, 32), Some(0xDEADBEEF));
        assert_eq!(cursor.position(), 121);
    }

    #[test]
    fn test_read_past_end() {
        let mut writer = BitWriter::new();
        writer.write_bits(0b11, 2);
        let data = writer.finish();
        let mut cursor = BitCursor::new();
        assert_eq!(cursor.read_bits(&data, 8), Some(0b1100_0000));
        assert_eq!(cursor.read_bit(&data), None);
    }
}
