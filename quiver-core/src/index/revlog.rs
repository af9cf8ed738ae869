//! Reverse log of tag index insertions
//!
//! Each record is the UTF-8 text `"<tag key> <tag value> <row>"`. Tags never
//! contain whitespace, so the record splits back into exactly three parts.

use crate::wal::MappedLog;
use crate::{QuiverError, Result};
use parking_lot::Mutex;
use std::path::Path;
use tracing::info;

/// Growth step of the reverse log
pub const REV_LOG_INCREMENT: usize = 1024 * 1024;

/// One replayed insertion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevEntry {
    pub key: String,
    pub value: String,
    pub row: u32,
}

impl RevEntry {
    fn parse(offset: usize, payload: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(payload).map_err(|e| {
            QuiverError::Corruption(format!("reverse log record at {}: {}", offset, e))
        })?;
        let parts: Vec<&str> = text.split(' ').collect();
        if parts.len() != 3 {
            return Err(QuiverError::Corruption(format!(
                "reverse log record at {} has {} fields: {:?}",
                offset,
                parts.len(),
                text
            )));
        }
        let row = parts[2].parse::<u32>().map_err(|e| {
            QuiverError::Corruption(format!(
                "reverse log record at {} has bad row {:?}: {}",
                offset, parts[2], e
            ))
        })?;
        Ok(Self {
            key: parts[0].to_string(),
            value: parts[1].to_string(),
            row,
        })
    }
}

/// Memory-mapped reverse log `<index dir>/<measurement>.rev`
pub struct RevLog {
    log: Mutex<MappedLog>,
}

impl RevLog {
    /// Open the log and return every record in file order. A malformed record
    /// fails the whole replay.
    pub fn open(path: &Path) -> Result<(Self, Vec<RevEntry>)> {
        let (log, existed) = MappedLog::open(path, REV_LOG_INCREMENT)?;
        let mut entries = Vec::new();
        if existed {
            for record in log.records() {
                let (offset, payload) = record?;
                entries.push(RevEntry::parse(offset, payload)?);
            }
            info!("Replayed {} tag index records from {:?}", entries.len(), path);
        }
        Ok((
            Self {
                log: Mutex::new(log),
            },
            entries,
        ))
    }

    pub fn append(&self, key: &str, value: &str, row: u32) -> Result<()> {
        let record = format!("{} {} {}", key, value, row);
        self.log.lock().append(record.as_bytes())?;
        Ok(())
    }

    /// Bytes in use, header included
    pub fn len(&self) -> usize {
        self.log.lock().limit()
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= crate::wal::HEADER_LEN
    }

    pub fn flush(&self) -> Result<()> {
        self.log.lock().flush()
    }
}
