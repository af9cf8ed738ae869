//! Series log writer

use super::SeriesEntry;
use crate::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Appends series creations to disk
pub struct SeriesLogWriter {
    path: PathBuf,
    inner: Mutex<SeriesLogWriterInner>,
}

struct SeriesLogWriterInner {
    file: BufWriter<File>,
    bytes_written: u64,
}

impl SeriesLogWriter {
    /// Open the log for appending after its first `valid_len` bytes.
    ///
    /// Bytes past `valid_len` (a torn tail found during recovery) are discarded.
    pub fn open(path: &Path, valid_len: u64) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .read(true)
            .open(path)?;
        file.set_len(valid_len)?;
        file.seek(SeekFrom::Start(valid_len))?;

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(SeriesLogWriterInner {
                file: BufWriter::new(file),
                bytes_written: valid_len,
            }),
        })
    }

    /// Append an entry and hand it to the OS, returning its offset
    pub fn append(&self, entry: &SeriesEntry) -> Result<u64> {
        let serialized = entry.serialize_with_checksum()?;
        let mut inner = self.inner.lock();

        let offset = inner.bytes_written;
        inner.file.write_all(&serialized)?;
        inner.file.flush()?;
        inner.bytes_written += serialized.len() as u64;

        Ok(offset)
    }

    /// Force sync to disk
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        inner.file.get_ref().sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes in the log
    pub fn len(&self) -> u64 {
        self.inner.lock().bytes_written
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
