//! Pointer log: the durable directory of allocated buffers
//!
//! Each allocation appends one record describing where the buffer lives and
//! which segment owns it. Freeing a buffer flips the record's state byte in
//! place. Replaying the log is how segments are found again after a restart.

use super::{BufferId, SegmentTag};
use crate::wal::{MappedLog, HEADER_LEN, LEN_PREFIX};
use crate::{QuiverError, Result};
use bytes::{Buf, BufMut, BytesMut};
use std::path::Path;
use tracing::{info, warn};

pub const STATE_LIVE: u8 = 1;
pub const STATE_FREE: u8 = 2;

/// state + file + offset + size + row + bucket + seq + base_seq
const FIXED_LEN: usize = 1 + 4 + 4 + 4 + 4 + 8 + 4 + 4;
const CRC_LEN: usize = 4;

/// One decoded pointer record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtrRecord {
    pub id: BufferId,
    pub state: u8,
    pub file: u32,
    pub offset: u32,
    pub size: u32,
    pub tag: SegmentTag,
}

impl PtrRecord {
    pub fn is_live(&self) -> bool {
        self.state == STATE_LIVE
    }

    fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FIXED_LEN + self.tag.field.len() + CRC_LEN);
        buf.put_u8(self.state);
        buf.put_u32_le(self.file);
        buf.put_u32_le(self.offset);
        buf.put_u32_le(self.size);
        buf.put_u32_le(self.tag.row);
        buf.put_i64_le(self.tag.bucket);
        buf.put_u32_le(self.tag.seq);
        buf.put_u32_le(self.tag.base_seq);
        buf.put_slice(self.tag.field.as_bytes());
        // The state byte changes in place, so it is left out of the checksum
        let crc = crc32fast::hash(&buf[1..]);
        buf.put_u32_le(crc);
        buf.to_vec()
    }

    fn decode(id: BufferId, payload: &[u8]) -> Result<Self> {
        if payload.len() < FIXED_LEN + CRC_LEN {
            return Err(QuiverError::Corruption(format!(
                "pointer record {} is {} bytes",
                id,
                payload.len()
            )));
        }
        let (body, mut crc) = payload.split_at(payload.len() - CRC_LEN);
        let expected = crc.get_u32_le();
        let actual = crc32fast::hash(&body[1..]);
        if expected != actual {
            return Err(QuiverError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let state = cursor.get_u8();
        if state != STATE_LIVE && state != STATE_FREE {
            return Err(QuiverError::Corruption(format!(
                "pointer record {} has state {}",
                id, state
            )));
        }
        let file = cursor.get_u32_le();
        let offset = cursor.get_u32_le();
        let size = cursor.get_u32_le();
        let row = cursor.get_u32_le();
        let bucket = cursor.get_i64_le();
        let seq = cursor.get_u32_le();
        let base_seq = cursor.get_u32_le();
        let field = String::from_utf8(cursor.to_vec())
            .map_err(|e| QuiverError::Corruption(format!("pointer record {}: {}", id, e)))?;

        Ok(Self {
            id,
            state,
            file,
            offset,
            size,
            tag: SegmentTag {
                row,
                field,
                bucket,
                seq,
                base_seq,
            },
        })
    }
}

/// Memory-mapped pointer log `<measurement>.ptr`
pub struct PtrLog {
    log: MappedLog,
}

impl PtrLog {
    /// Open the log and replay it. Replay stops at the first damaged record and
    /// the log is cut back to that point.
    pub fn open(path: &Path, increment: usize) -> Result<(Self, Vec<PtrRecord>)> {
        let (mut log, existed) = MappedLog::open(path, increment)?;
        let mut records = Vec::new();
        let mut valid_end = HEADER_LEN;
        let mut damaged = false;

        if existed {
            for item in log.records() {
                let decoded = item.and_then(|(offset, payload)| {
                    PtrRecord::decode(BufferId(offset as u64), payload)
                        .map(|record| (offset + LEN_PREFIX + payload.len(), record))
                });
                match decoded {
                    Ok((end, record)) => {
                        records.push(record);
                        valid_end = end;
                    }
                    Err(e) => {
                        warn!(
                            "Pointer log {:?} damaged after offset {}, truncating: {}",
                            path, valid_end, e
                        );
                        damaged = true;
                        break;
                    }
                }
            }
        }
        if damaged {
            log.truncate_to(valid_end);
        }

        info!(
            "Replayed {} pointer records from {:?}",
            records.len(),
            log.path()
        );
        Ok((Self { log }, records))
    }

    /// Record a new live buffer
    pub fn append(&mut self, file: u32, offset: u32, size: u32, tag: &SegmentTag) -> Result<BufferId> {
        let record = PtrRecord {
            id: BufferId(0),
            state: STATE_LIVE,
            file,
            offset,
            size,
            tag: tag.clone(),
        };
        let offset = self.log.append(&record.encode())?;
        Ok(BufferId(offset as u64))
    }

    /// Flip a record to free
    pub fn mark_free(&mut self, id: BufferId) -> Result<()> {
        self.log.patch(id.0 as usize, 0, &[STATE_FREE])
    }

    /// Bytes of the log in use
    pub fn len(&self) -> usize {
        self.log.limit()
    }

    pub fn is_empty(&self) -> bool {
        self.log.limit() <= HEADER_LEN
    }

    pub fn flush(&self) -> Result<()> {
        self.log.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tag(row: u32, bucket: i64) -> SegmentTag {
        SegmentTag {
            row,
            field: "usage".to_string(),
            bucket,
            seq: 0,
            base_seq: 0,
        }
    }

    #[test]
    fn test_append_free_replay() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cpu.ptr");

        let (first, second) = {
            let (mut log, records) = PtrLog::open(&path, 1024).unwrap();
            assert!(records.is_empty());
            let first = log.append(0, 0, 4096, &tag(1, 10)).unwrap();
            let second = log.append(0, 4096, 4096, &tag(2, 11)).unwrap();
            log.mark_free(first).unwrap();
            log.flush().unwrap();
            (first, second)
        };

        let (_, records) = PtrLog::open(&path, 1024).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].id, first);
        assert!(!records[0].is_live());
        assert_eq!(records[1].id, second);
        assert!(records[1].is_live());
        assert_eq!(records[1].offset, 4096);
        assert_eq!(records[1].tag, tag(2, 11));
    }

    #[test]
    fn test_replay_stops_at_damaged_record() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cpu.ptr");

        let damaged = {
            let (mut log, _) = PtrLog::open(&path, 1024).unwrap();
            log.append(0, 0, 64, &tag(0, 1)).unwrap();
            let damaged = log.append(0, 64, 64, &tag(1, 1)).unwrap();
            log.append(0, 128, 64, &tag(2, 1)).unwrap();
            // Scribble over the row of the middle record
            log.log.patch(damaged.0 as usize, 13, &[0xAB]).unwrap();
            log.flush().unwrap();
            damaged
        };

        let (log, records) = PtrLog::open(&path, 1024).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(log.len(), damaged.0 as usize);
    }
}
