//! Buffer allocator
//!
//! `Malloc` carves fixed-size regions out of memory-mapped data files
//! (`<measurement>_<n>.data`) and records every allocation in the pointer log
//! (`<measurement>.ptr`). Regions are addressed by (file, offset), so they stay
//! valid while a data file grows and is remapped.
//!
//! Released regions go onto a free list and are handed out again to requests
//! that fit. Reuse appends a fresh pointer record; the old one stays marked free.

mod ptrlog;
mod region;

pub use ptrlog::PtrRecord;
pub use region::Region;

use crate::{QuiverError, Result};
use parking_lot::Mutex;
use ptrlog::PtrLog;
use region::DataFile;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Identifier of an allocated buffer (the offset of its pointer record)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub u64);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owner of a buffer, persisted with the allocation so segments can be
/// reattached to their series after a restart
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentTag {
    /// Series row index
    pub row: u32,
    pub field: String,
    /// Time bucket id
    pub bucket: i64,
    /// Position of the segment within its bucket
    pub seq: u32,
    /// Lowest seq folded into this segment by compaction; equal to `seq` otherwise
    pub base_seq: u32,
}

/// Allocator limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MallocConfig {
    /// Largest size of one data file
    pub file_max: usize,
    /// Growth step of a data file
    pub file_increment: usize,
    /// Cap on bytes handed out across all data files
    pub total_max: Option<u64>,
    /// Growth step of the pointer log
    pub ptrfile_increment: usize,
}

impl Default for MallocConfig {
    fn default() -> Self {
        Self {
            file_max: crate::config::DEFAULT_FILE_MAX,
            file_increment: crate::config::DEFAULT_FILE_INCREMENT,
            total_max: None,
            ptrfile_increment: crate::config::DEFAULT_PTRFILE_INCREMENT,
        }
    }
}

/// A live buffer found in the pointer log on open
#[derive(Debug, Clone)]
pub struct RecoveredBuffer {
    pub id: BufferId,
    pub tag: SegmentTag,
    pub region: Region,
}

/// Allocator usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MallocStats {
    pub data_files: usize,
    /// Bytes carved out of data files, live or free
    pub allocated_bytes: u64,
    pub live_buffers: usize,
    pub free_buffers: usize,
    pub free_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    file: u32,
    offset: u32,
    size: u32,
}

struct MallocInner {
    files: Vec<Arc<DataFile>>,
    /// Next unused offset in the last data file
    tail: usize,
    /// Bytes carved out of all files
    allocated: u64,
    ptr_log: PtrLog,
    live: HashMap<BufferId, Slot>,
    free: Vec<Slot>,
}

/// Memory-mapped buffer allocator for one measurement
pub struct Malloc {
    measurement: String,
    data_dir: PathBuf,
    config: MallocConfig,
    inner: Mutex<MallocInner>,
}

impl Malloc {
    /// Open the allocator, replaying the pointer log. Returns the live buffers
    /// ordered by (row, field, bucket, seq).
    pub fn open(
        data_dir: &Path,
        measurement: &str,
        config: MallocConfig,
    ) -> Result<(Self, Vec<RecoveredBuffer>)> {
        fs::create_dir_all(data_dir)?;

        let ptr_path = data_dir.join(format!("{}.ptr", measurement));
        let (ptr_log, records) = PtrLog::open(&ptr_path, config.ptrfile_increment)?;

        // The latest record for a location wins; earlier ones were freed before reuse
        let mut by_location: HashMap<(u32, u32), PtrRecord> = HashMap::new();
        let mut last_file = 0u32;
        for record in records {
            last_file = last_file.max(record.file);
            by_location.insert((record.file, record.offset), record);
        }

        let mut files = Vec::with_capacity(last_file as usize + 1);
        for index in 0..=last_file {
            let path = Self::data_path(data_dir, measurement, index);
            let initial = config.file_increment.min(config.file_max);
            files.push(Arc::new(DataFile::open(&path, index, initial)?));
        }

        let mut tail = 0usize;
        let mut allocated = 0u64;
        let mut live = HashMap::new();
        let mut free = Vec::new();
        let mut recovered = Vec::new();

        for record in by_location.into_values() {
            let slot = Slot {
                file: record.file,
                offset: record.offset,
                size: record.size,
            };
            let end = record.offset as usize + record.size as usize;
            let file = &files[record.file as usize];
            if end > file.len() {
                warn!(
                    "Buffer {} ends at {} past the end of {:?}, dropping it",
                    record.id,
                    end,
                    file.path()
                );
                continue;
            }
            if record.file == last_file {
                tail = tail.max(end);
            }
            allocated += record.size as u64;

            if record.is_live() {
                live.insert(record.id, slot);
                recovered.push(RecoveredBuffer {
                    id: record.id,
                    tag: record.tag,
                    region: Region::new(file.clone(), record.offset as usize, record.size as usize),
                });
            } else {
                free.push(slot);
            }
        }

        recovered.sort_by(|a, b| {
            (a.tag.row, &a.tag.field, a.tag.bucket, a.tag.seq)
                .cmp(&(b.tag.row, &b.tag.field, b.tag.bucket, b.tag.seq))
        });

        info!(
            "Opened allocator for {} in {:?}: {} data files, {} live buffers, {} free",
            measurement,
            data_dir,
            files.len(),
            live.len(),
            free.len()
        );

        Ok((
            Self {
                measurement: measurement.to_string(),
                data_dir: data_dir.to_path_buf(),
                config,
                inner: Mutex::new(MallocInner {
                    files,
                    tail,
                    allocated,
                    ptr_log,
                    live,
                    free,
                }),
            },
            recovered,
        ))
    }

    fn data_path(data_dir: &Path, measurement: &str, index: u32) -> PathBuf {
        data_dir.join(format!("{}_{}.data", measurement, index))
    }

    pub fn config(&self) -> &MallocConfig {
        &self.config
    }

    /// Allocate a region of at least `size` bytes owned by `tag`
    pub fn allocate(&self, tag: &SegmentTag, size: usize) -> Result<(BufferId, Region)> {
        if size == 0 || size > self.config.file_max {
            return Err(QuiverError::Capacity(format!(
                "cannot allocate {} bytes with a data file limit of {}",
                size, self.config.file_max
            )));
        }
        let mut inner = self.inner.lock();

        // Smallest free region that fits
        let reuse = inner
            .free
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.size as usize >= size)
            .min_by_key(|(_, slot)| slot.size)
            .map(|(i, _)| i);

        let slot = match reuse {
            Some(i) => inner.free.swap_remove(i),
            None => self.carve(&mut inner, size)?,
        };

        let id = match inner.ptr_log.append(slot.file, slot.offset, slot.size, tag) {
            Ok(id) => id,
            Err(e) => {
                if reuse.is_some() {
                    inner.free.push(slot);
                }
                return Err(e);
            }
        };
        inner.live.insert(id, slot);
        let file = inner.files[slot.file as usize].clone();
        debug!(
            "Allocated buffer {} ({} bytes at {}:{}) for row {} field {} bucket {}",
            id, slot.size, slot.file, slot.offset, tag.row, tag.field, tag.bucket
        );

        Ok((id, Region::new(file, slot.offset as usize, slot.size as usize)))
    }

    /// Take fresh space from the end of the last data file, starting a new file
    /// when it is full
    fn carve(&self, inner: &mut MallocInner, size: usize) -> Result<Slot> {
        if let Some(total_max) = self.config.total_max {
            if inner.allocated + size as u64 > total_max {
                return Err(QuiverError::Capacity(format!(
                    "allocating {} bytes would exceed the total limit of {} bytes ({} in use)",
                    size, total_max, inner.allocated
                )));
            }
        }

        if inner.tail + size > self.config.file_max {
            let index = inner.files.len() as u32;
            let path = Self::data_path(&self.data_dir, &self.measurement, index);
            let initial = self.config.file_increment.min(self.config.file_max);
            inner.files.push(Arc::new(DataFile::open(&path, index, initial)?));
            inner.tail = 0;
            info!("Started data file {:?}", path);
        }

        let file = inner
            .files
            .last()
            .cloned()
            .ok_or_else(|| QuiverError::Internal("allocator has no data file".into()))?;
        file.ensure_len(
            inner.tail + size,
            self.config.file_increment,
            self.config.file_max,
        )?;

        let slot = Slot {
            file: file.index(),
            offset: inner.tail as u32,
            size: size as u32,
        };
        inner.tail += size;
        inner.allocated += size as u64;
        Ok(slot)
    }

    /// Release buffers for reuse. Unknown ids are skipped. Returns how many were freed.
    pub fn cleanup_buffer_ids(&self, ids: &HashSet<BufferId>) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut freed = 0;
        for id in ids {
            let Some(slot) = inner.live.get(id).copied() else {
                warn!("Ignoring cleanup of unknown buffer {}", id);
                continue;
            };
            inner.ptr_log.mark_free(*id)?;
            inner.live.remove(id);
            inner.free.push(slot);
            freed += 1;
            debug!("Released buffer {}", id);
        }
        Ok(freed)
    }

    pub fn stats(&self) -> MallocStats {
        let inner = self.inner.lock();
        MallocStats {
            data_files: inner.files.len(),
            allocated_bytes: inner.allocated,
            live_buffers: inner.live.len(),
            free_buffers: inner.free.len(),
            free_bytes: inner.free.iter().map(|s| s.size as u64).sum(),
        }
    }

    /// Force data files and the pointer log to disk
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        for file in &inner.files {
            file.flush()?;
        }
        inner.ptr_log.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.flush()?;
        info!("Closed allocator for {}", self.measurement);
        Ok(())
    }
}
