//! Memory-mapped append-only log
//!
//! Layout: a 4-byte little-endian "offset limit" header followed by
//! `[u32 length][payload]` records. The header is rewritten after every append,
//! so a record is only visible once it has been written completely.

use crate::{QuiverError, Result};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Size of the offset limit header
pub const HEADER_LEN: usize = 4;

/// Size of the per-record length prefix
pub const LEN_PREFIX: usize = 4;

/// Growable memory-mapped log
pub struct MappedLog {
    path: PathBuf,
    file: File,
    map: MmapMut,
    increment: usize,
}

impl MappedLog {
    /// Open an existing log or create an empty one. Returns whether the file existed.
    pub fn open(path: &Path, increment: usize) -> Result<(Self, bool)> {
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let current = file.metadata()?.len() as usize;
        let len = if current < HEADER_LEN {
            file.set_len(increment as u64)?;
            increment
        } else {
            current
        };

        let map = Self::map(&file, len)?;
        let mut log = Self {
            path: path.to_path_buf(),
            file,
            map,
            increment,
        };

        if !existed || current < HEADER_LEN {
            log.set_limit(HEADER_LEN);
        } else {
            let limit = log.limit();
            if limit < HEADER_LEN || limit > log.map.len() {
                return Err(QuiverError::Corruption(format!(
                    "log {:?} has invalid offset limit {}",
                    log.path, limit
                )));
            }
        }
        Ok((log, existed && current >= HEADER_LEN))
    }

    fn map(file: &File, len: usize) -> Result<MmapMut> {
        // SAFETY: the log file is private to this process and only touched
        // through this struct.
        let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        Ok(map)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Offset one past the last complete record
    pub fn limit(&self) -> usize {
        u32::from_le_bytes([self.map[0], self.map[1], self.map[2], self.map[3]]) as usize
    }

    fn set_limit(&mut self, limit: usize) {
        self.map[0..HEADER_LEN].copy_from_slice(&(limit as u32).to_le_bytes());
    }

    /// Mapped capacity in bytes
    pub fn capacity(&self) -> usize {
        self.map.len()
    }

    /// Append a record and return its offset
    pub fn append(&mut self, payload: &[u8]) -> Result<usize> {
        let offset = self.limit();
        let needed = offset + LEN_PREFIX + payload.len();
        if needed > self.map.len() {
            self.grow(needed)?;
        }
        self.map[offset..offset + LEN_PREFIX].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        self.map[offset + LEN_PREFIX..needed].copy_from_slice(payload);
        self.set_limit(needed);
        Ok(offset)
    }

    fn grow(&mut self, needed: usize) -> Result<()> {
        let mut new_len = self.map.len();
        while new_len < needed {
            new_len += self.increment;
        }
        if new_len > u32::MAX as usize {
            return Err(QuiverError::Capacity(format!(
                "log {:?} cannot grow beyond 4GiB",
                self.path
            )));
        }
        self.map.flush()?;
        self.file.set_len(new_len as u64)?;
        self.map = Self::map(&self.file, new_len)?;
        debug!("Remapped log {:?} to {} bytes", self.path, new_len);
        Ok(())
    }

    /// Payload of the record at `offset`
    pub fn record(&self, offset: usize) -> Result<&[u8]> {
        let limit = self.limit();
        if offset + LEN_PREFIX > limit {
            return Err(QuiverError::Internal(format!(
                "record offset {} beyond log limit {}",
                offset, limit
            )));
        }
        let len = self.read_len(offset);
        let end = offset + LEN_PREFIX + len;
        if end > limit {
            return Err(QuiverError::Corruption(format!(
                "record at {} overruns log limit {}",
                offset, limit
            )));
        }
        Ok(&self.map[offset + LEN_PREFIX..end])
    }

    /// Overwrite payload bytes of an existing record in place
    pub fn patch(&mut self, offset: usize, payload_pos: usize, bytes: &[u8]) -> Result<()> {
        let len = self.record(offset)?.len();
        if payload_pos + bytes.len() > len {
            return Err(QuiverError::Internal(format!(
                "patch overruns record at {}",
                offset
            )));
        }
        let start = offset + LEN_PREFIX + payload_pos;
        self.map[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn read_len(&self, offset: usize) -> usize {
        u32::from_le_bytes([
            self.map[offset],
            self.map[offset + 1],
            self.map[offset + 2],
            self.map[offset + 3],
        ]) as usize
    }

    /// Iterate over the complete records in file order
    pub fn records(&self) -> Records<'_> {
        Records {
            log: self,
            pos: HEADER_LEN,
            limit: self.limit(),
        }
    }

    /// Drop every record at or after `offset`
    pub fn truncate_to(&mut self, offset: usize) {
        self.set_limit(offset.max(HEADER_LEN));
    }

    /// Force pending writes to disk
    pub fn flush(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }
}

/// Iterator over `(offset, payload)` pairs of a [`MappedLog`]
pub struct Records<'a> {
    log: &'a MappedLog,
    pos: usize,
    limit: usize,
}

impl<'a> Iterator for Records<'a> {
    type Item = Result<(usize, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.limit {
            return None;
        }
        let offset = self.pos;
        if offset + LEN_PREFIX > self.limit {
            self.pos = self.limit;
            return Some(Err(QuiverError::Corruption(format!(
                "truncated length prefix at {}",
                offset
            ))));
        }
        let len = self.log.read_len(offset);
        let end = offset + LEN_PREFIX + len;
        if end > self.limit {
            self.pos = self.limit;
            return Some(Err(QuiverError::Corruption(format!(
                "record at {} overruns log limit {}",
                offset, self.limit
            ))));
        }
        self.pos = end;
        Some(Ok((offset, &self.log.map[offset + LEN_PREFIX..end])))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("test.log");

        {
            let (mut log, existed) = MappedLog::open(&path, 64).unwrap();
            assert!(!existed);
            // Enough records to force several remaps
            for i in 0..50 {
                log.append(format!("record-{}", i).as_bytes()).unwrap();
            }
            assert!(log.capacity() > 64);
            log.flush().unwrap();
        }

        let (log, existed) = MappedLog::open(&path, 64).unwrap();
        assert!(existed);
        let records: Vec<String> = log
            .records()
            .map(|r| String::from_utf8(r.unwrap().1.to_vec()).unwrap())
            .collect();
        assert_eq!(records.len(), 50);
        assert_eq!(records[49], "record-49");
    }

    #[test]
    fn test_patch_and_truncate() {
        let temp_dir = TempDir::new().unwrap();
        let (mut log, _) = MappedLog::open(&temp_dir.path().join("p.log"), 1024).unwrap();
        let first = log.append(b"abc").unwrap();
        let second = log.append(b"def").unwrap();

        log.patch(first, 1, b"X").unwrap();
        assert_eq!(log.record(first).unwrap(), b"aXc");
        assert!(log.patch(first, 2, b"YY").is_err());

        log.truncate_to(second);
        assert_eq!(log.records().count(), 1);
    }
}
