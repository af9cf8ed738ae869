//! Series log entries and their framing

use crate::{QuiverError, Result, SeriesKey};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Size of the trailing checksum
const CRC_LEN: usize = 4;

/// One series creation: the row index handed out and the series identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesEntry {
    pub row: u32,
    pub key: SeriesKey,
}

impl SeriesEntry {
    pub fn new(row: u32, key: SeriesKey) -> Self {
        Self { row, key }
    }

    /// Serialize the entry with length prefix and CRC checksum
    ///
    /// Format:
    /// - 4 bytes: entry length (excluding this field)
    /// - N bytes: bincode-encoded entry
    /// - 4 bytes: CRC32 of the encoded entry
    pub fn serialize_with_checksum(&self) -> Result<Bytes> {
        let payload = bincode::serialize(self)?;
        let mut buf = BytesMut::with_capacity(4 + payload.len() + CRC_LEN);

        buf.put_u32_le((payload.len() + CRC_LEN) as u32);
        buf.put_slice(&payload);
        buf.put_u32_le(crc32fast::hash(&payload));

        Ok(buf.freeze())
    }

    /// Deserialize one entry from the front of `data`, validating its checksum.
    ///
    /// Returns `Ok(None)` when `data` holds only part of an entry, which is what a
    /// crash in the middle of an append leaves behind.
    pub fn deserialize_with_checksum(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let mut cursor = data;
        let len = cursor.get_u32_le() as usize;
        if len < CRC_LEN {
            return Err(QuiverError::Corruption(format!(
                "series log entry length {} is too small",
                len
            )));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }

        let entry_data = &data[4..4 + len];
        let (payload, mut crc) = entry_data.split_at(len - CRC_LEN);
        let expected = crc.get_u32_le();
        let actual = crc32fast::hash(payload);
        if expected != actual {
            return Err(QuiverError::ChecksumMismatch { expected, actual });
        }

        let entry: SeriesEntry = bincode::deserialize(payload)?;
        Ok(Some((entry, 4 + len)))
    }
}
