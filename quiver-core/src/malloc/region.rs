//! Memory-mapped data files and the regions carved out of them

use crate::{QuiverError, Result};
use bytes::Bytes;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One growable, memory-mapped data file
///
/// The mapping is replaced on growth, so callers never hold pointers into it;
/// every access goes through the lock with a (offset, len) pair.
pub(crate) struct DataFile {
    index: u32,
    path: PathBuf,
    file: File,
    map: RwLock<MmapMut>,
}

impl DataFile {
    /// Open or create a data file mapped to at least `initial_len` bytes
    pub fn open(path: &Path, index: u32, initial_len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let current = file.metadata()?.len() as usize;
        let len = current.max(initial_len);
        if current < len {
            file.set_len(len as u64)?;
        }
        let map = Self::map(&file, len)?;
        Ok(Self {
            index,
            path: path.to_path_buf(),
            file,
            map: RwLock::new(map),
        })
    }

    fn map(file: &File, len: usize) -> Result<MmapMut> {
        // SAFETY: the file is owned by this process for the lifetime of the
        // mapping and is only ever accessed through `DataFile`.
        let map = unsafe { MmapOptions::new().len(len).map_mut(file)? };
        Ok(map)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current mapped length
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// Grow the mapping in `increment` steps until it covers `end`, capped at `max`
    pub fn ensure_len(&self, end: usize, increment: usize, max: usize) -> Result<()> {
        let mut map = self.map.write();
        if map.len() >= end {
            return Ok(());
        }
        if end > max {
            return Err(QuiverError::Capacity(format!(
                "data file {:?} cannot grow to {} bytes (max {})",
                self.path, end, max
            )));
        }
        let mut new_len = map.len();
        while new_len < end {
            new_len += increment;
        }
        let new_len = new_len.min(max);
        map.flush()?;
        self.file.set_len(new_len as u64)?;
        *map = Self::map(&self.file, new_len)?;
        Ok(())
    }

    fn write_at(&self, offset: usize, bytes: &[u8]) {
        let mut map = self.map.write();
        map[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn read_at(&self, offset: usize, len: usize) -> Bytes {
        let map = self.map.read();
        let end = (offset + len).min(map.len());
        Bytes::copy_from_slice(&map[offset.min(end)..end])
    }

    pub fn flush(&self) -> Result<()> {
        self.map.read().flush()?;
        Ok(())
    }
}

/// A fixed-size byte range inside a data file
#[derive(Clone)]
pub struct Region {
    file: Arc<DataFile>,
    offset: usize,
    len: usize,
}

impl Region {
    pub(crate) fn new(file: Arc<DataFile>, offset: usize, len: usize) -> Self {
        Self { file, offset, len }
    }

    /// Size of the region in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Data file index and offset of the region
    pub fn location(&self) -> (u32, usize) {
        (self.file.index(), self.offset)
    }

    /// Overwrite bytes starting at `pos` within the region
    pub fn write(&self, pos: usize, bytes: &[u8]) -> Result<()> {
        if pos + bytes.len() > self.len {
            return Err(QuiverError::Internal(format!(
                "write of {} bytes at {} overflows region of {} bytes",
                bytes.len(),
                pos,
                self.len
            )));
        }
        self.file.write_at(self.offset + pos, bytes);
        Ok(())
    }

    /// Copy up to `len` bytes starting at `pos`, clamped to the region
    pub fn read(&self, pos: usize, len: usize) -> Bytes {
        let pos = pos.min(self.len);
        let len = len.min(self.len - pos);
        self.file.read_at(self.offset + pos, len)
    }

    /// Copy the whole region
    pub fn read_all(&self) -> Bytes {
        self.read(0, self.len)
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("file", &self.file.index())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_region_survives_growth() {
        let temp_dir = TempDir::new().unwrap();
        let file = Arc::new(DataFile::open(&temp_dir.path().join("m_0.data"), 0, 4096).unwrap());

        let region = Region::new(file.clone(), 1024, 128);
        region.write(0, b"hello").unwrap();

        file.ensure_len(10_000, 4096, 1 << 20).unwrap();
        assert_eq!(file.len(), 12_288);
        assert_eq!(&region.read(0, 5)[..], b"hello");

        assert!(region.write(125, b"toolong").is_err());
        assert!(file.ensure_len(2 << 20, 4096, 1 << 20).is_err());
    }
}
