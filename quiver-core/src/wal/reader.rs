//! Series log reader for recovery

use super::SeriesEntry;
use crate::{QuiverError, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Reads back the series log after a restart
pub struct SeriesLogReader;

impl SeriesLogReader {
    /// Recover every complete entry in file order.
    ///
    /// Returns the entries together with the length of the valid prefix of the
    /// file; anything past it is a torn or corrupted tail.
    pub fn recover(path: &Path) -> Result<(Vec<SeriesEntry>, u64)> {
        if !path.exists() {
            return Ok((Vec::new(), 0));
        }
        let data = fs::read(path)?;

        let mut entries = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match SeriesEntry::deserialize_with_checksum(&data[offset..]) {
                Ok(Some((entry, bytes_read))) => {
                    entries.push(entry);
                    offset += bytes_read;
                }
                Ok(None) => {
                    warn!(
                        "Incomplete entry at offset {} in {:?}, truncating",
                        offset, path
                    );
                    break;
                }
                Err(e @ QuiverError::ChecksumMismatch { .. })
                | Err(e @ QuiverError::Corruption(_))
                | Err(e @ QuiverError::InvalidFormat(_)) => {
                    warn!("{} at offset {} in {:?}, truncating", e, offset, path);
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        info!("Recovered {} series from {:?}", entries.len(), path);
        Ok((entries, offset as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::SeriesLogWriter;
    use crate::{SeriesKey, Tag};
    use std::io::Write;
    use tempfile::TempDir;

    fn key(i: usize) -> SeriesKey {
        SeriesKey::from_sorted_tags(&[Tag::new("id", i.to_string())])
    }

    #[test]
    fn test_series_log_recovery() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cpu.series");

        {
            let writer = SeriesLogWriter::open(&path, 0).unwrap();
            for i in 0..10 {
                writer.append(&SeriesEntry::new(i as u32, key(i))).unwrap();
            }
            writer.sync().unwrap();
        }

        let (entries, valid_len) = SeriesLogReader::recover(&path).unwrap();
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[3].key, key(3));
        assert_eq!(valid_len, fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cpu.series");
        {
            let writer = SeriesLogWriter::open(&path, 0).unwrap();
            writer.append(&SeriesEntry::new(0, key(0))).unwrap();
            writer.sync().unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(&[40, 0, 0, 0, 1, 2])
            .unwrap();

        let (entries, valid_len) = SeriesLogReader::recover(&path).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(valid_len, good_len);

        // Reopening for append cuts the torn bytes off
        let writer = SeriesLogWriter::open(&path, valid_len).unwrap();
        writer.append(&SeriesEntry::new(1, key(1))).unwrap();
        writer.sync().unwrap();
        let (entries, _) = SeriesLogReader::recover(&path).unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn test_missing_log() {
        let temp_dir = TempDir::new().unwrap();
        let (entries, len) = SeriesLogReader::recover(&temp_dir.path().join("none")).unwrap();
        assert!(entries.is_empty());
        assert_eq!(len, 0);
    }
}
