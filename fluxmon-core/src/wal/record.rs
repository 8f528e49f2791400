//! WAL record types and framing

use crate::{Error, Labels, Result, SeriesRef, Timestamp};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Record type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// New series definitions
    Series = 1,
    /// Accepted samples
    Samples = 2,
    /// Deletion intervals
    Tombstones = 3,
}

impl TryFrom<u8> for RecordType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RecordType::Series),
            2 => Ok(RecordType::Samples),
            3 => Ok(RecordType::Tombstones),
            _ => Err(Error::InvalidFormat(format!("Invalid WAL record type: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesRecord {
    pub series_ref: SeriesRef,
    pub labels: Labels,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleRecord {
    pub series_ref: SeriesRef,
    pub t: Timestamp,
    pub v: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TombstoneRecord {
    pub series_ref: SeriesRef,
    pub mint: Timestamp,
    pub maxt: Timestamp,
}

/// A single WAL record
#[derive(Debug, Clone, PartialEq)]
pub enum WalRecord {
    Series(Vec<SeriesRecord>),
    Samples(Vec<SampleRecord>),
    Tombstones(Vec<TombstoneRecord>),
}

/// Length prefix + type byte + checksum
const FRAME_OVERHEAD: usize = 4 + 1 + 4;

impl WalRecord {
    pub fn record_type(&self) -> RecordType {
        match self {
            WalRecord::Series(_) => RecordType::Series,
            WalRecord::Samples(_) => RecordType::Samples,
            WalRecord::Tombstones(_) => RecordType::Tombstones,
        }
    }

    /// Serialize with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: length of everything after this field
    /// - 1 byte: record type
    /// - N bytes: bincode payload
    /// - 4 bytes: CRC32 of type and payload
    pub fn encode(&self) -> Result<Bytes> {
        let payload = match self {
            WalRecord::Series(s) => bincode::serialize(s),
            WalRecord::Samples(s) => bincode::serialize(s),
            WalRecord::Tombstones(s) => bincode::serialize(s),
        }
        .map_err(|e| Error::InvalidFormat(e.to_string()))?;

        let mut buf = BytesMut::with_capacity(FRAME_OVERHEAD + payload.len());
        buf.put_u32_le((1 + payload.len() + 4) as u32);
        buf.put_u8(self.record_type() as u8);
        buf.put_slice(&payload);
        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);
        Ok(buf.freeze())
    }

    /// Decode one record from the front of `data`.
    ///
    /// Returns `Ok(None)` when `data` ends mid-record, which happens when
    /// the process died during a write.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = (&data[..4]).get_u32_le() as usize;
        if len < 5 {
            return Err(Error::Corruption(format!("WAL record length {} too small", len)));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }

        let body = &data[4..4 + len];
        let (content, crc) = body.split_at(len - 4);
        let expected = (&crc[..]).get_u32_le();
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(Error::ChecksumMismatch { expected, actual });
        }

        let payload = &content[1..];
        let decode_err = |e: bincode::Error| Error::InvalidFormat(e.to_string());
        let record = match RecordType::try_from(content[0])? {
            RecordType::Series => WalRecord::Series(bincode::deserialize(payload).map_err(decode_err)?),
            RecordType::Samples => WalRecord::Samples(bincode::deserialize(payload).map_err(decode_err)?),
            RecordType::Tombstones => {
                WalRecord::Tombstones(bincode::deserialize(payload).map_err(decode_err)?)
            }
        };
        Ok(Some((record, 4 + len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_framing() {
        let record = WalRecord::Series(vec![SeriesRecord {
            series_ref: 7,
            labels: Labels::from_pairs(&[("__name__", "up"), ("job", "api")]),
        }]);
        let encoded = record.encode().unwrap();
        let (decoded, used) = WalRecord::decode(&encoded).unwrap().unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_torn_tail_is_not_an_error() {
        let record = WalRecord::Samples(vec![SampleRecord { series_ref: 1, t: 10, v: 1.5 }]);
        let encoded = record.encode().unwrap();
        assert!(WalRecord::decode(&encoded[..encoded.len() - 3]).unwrap().is_none());
        assert!(WalRecord::decode(&encoded[..2]).unwrap().is_none());
    }

    #[test]
    fn test_checksum_validation() {
        let record = WalRecord::Tombstones(vec![TombstoneRecord { series_ref: 1, mint: 0, maxt: 100 }]);
        let mut encoded = record.encode().unwrap().to_vec();
        encoded[6] ^= 0xFF;
        assert!(matches!(
            WalRecord::decode(&encoded),
            Err(Error::ChecksumMismatch { .. })
        ));
    }
}
