//! Inverted tag index
//!
//! tag key → tag value → bitmap of series row indices. The outer and inner maps
//! are lock-free skip lists, so indexing under different tag keys never
//! contends; each bitmap has its own lock.
//!
//! Every first insertion of a row into a bitmap is appended to the reverse log
//! before it becomes visible. On open the log is replayed in order to rebuild
//! the maps.

mod filter;
mod revlog;

pub use filter::TagFilter;
pub use revlog::{RevEntry, RevLog, REV_LOG_INCREMENT};

use crate::{Result, SeriesKey, Tag};
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::info;

/// Maps a row index back to the series that owns it
pub trait RowKeyResolver {
    fn series_key(&self, row: u32) -> Option<SeriesKey>;
}

type ValueMap = SkipMap<String, RwLock<RoaringBitmap>>;

/// Bitmap tag index of one measurement
pub struct TagIndex {
    measurement: String,
    index: SkipMap<String, ValueMap>,
    /// Every row present in any bitmap
    all_rows: RwLock<RoaringBitmap>,
    rev_log: RevLog,
}

impl TagIndex {
    /// Open the index in `index_dir`, replaying its reverse log
    pub fn open(index_dir: &Path, measurement: &str) -> Result<Self> {
        fs::create_dir_all(index_dir)?;
        let path = index_dir.join(format!("{}.rev", measurement));
        let (rev_log, entries) = RevLog::open(&path)?;

        let tag_index = Self {
            measurement: measurement.to_string(),
            index: SkipMap::new(),
            all_rows: RwLock::new(RoaringBitmap::new()),
            rev_log,
        };
        let replayed = entries.len();
        for entry in entries {
            tag_index.with_bitmap(&entry.key, &entry.value, |bitmap| {
                bitmap.write().insert(entry.row);
            });
            tag_index.all_rows.write().insert(entry.row);
        }

        info!(
            "Opened tag index for {}: {} records, {} tag keys",
            measurement,
            replayed,
            tag_index.index.len()
        );
        Ok(tag_index)
    }

    /// Run `f` on the bitmap of `key=value`, creating it if needed
    fn with_bitmap<R>(&self, key: &str, value: &str, f: impl FnOnce(&RwLock<RoaringBitmap>) -> R) -> R {
        let values = self.index.get_or_insert_with(key.to_string(), SkipMap::new);
        let bitmap = values
            .value()
            .get_or_insert_with(value.to_string(), || RwLock::new(RoaringBitmap::new()));
        f(bitmap.value())
    }

    /// Add `row` to the bitmap of `key=value`. Returns whether the row was new
    /// to that bitmap, in which case it was also logged.
    pub fn index(&self, key: &str, value: &str, row: u32) -> Result<bool> {
        let inserted = self.with_bitmap(key, value, |bitmap| -> Result<bool> {
            let mut bitmap = bitmap.write();
            if bitmap.contains(row) {
                return Ok(false);
            }
            self.rev_log.append(key, value, row)?;
            bitmap.insert(row);
            Ok(true)
        })?;
        if inserted {
            self.all_rows.write().insert(row);
        }
        Ok(inserted)
    }

    /// Validate and index every tag of a series
    pub fn index_tags(&self, tags: &[Tag], row: u32) -> Result<()> {
        for tag in tags {
            tag.validate()?;
        }
        for tag in tags {
            self.index(&tag.key, &tag.value, row)?;
        }
        Ok(())
    }

    /// Copy of the bitmap for `key=value`
    pub fn rows_for_tag(&self, key: &str, value: &str) -> Option<RoaringBitmap> {
        let values = self.index.get(key)?;
        let bitmap = values.value().get(value)?;
        let rows = bitmap.value().read().clone();
        Some(rows)
    }

    /// Series carrying `key=value`, in row order
    pub fn search_row_keys_for_tag(
        &self,
        key: &str,
        value: &str,
        resolver: &dyn RowKeyResolver,
    ) -> Vec<SeriesKey> {
        self.rows_for_tag(key, value)
            .map(|rows| rows.iter().filter_map(|row| resolver.series_key(row)).collect())
            .unwrap_or_default()
    }

    /// Rows matched by a filter tree. AND intersects and OR unites the
    /// children's bitmaps.
    pub fn evaluate_rows(&self, filter: &TagFilter) -> RoaringBitmap {
        match filter {
            TagFilter::Equals { key, value } => self.rows_for_tag(key, value).unwrap_or_default(),
            TagFilter::And(children) => {
                let mut children = children.iter();
                let mut acc = match children.next() {
                    Some(first) => self.evaluate_rows(first),
                    None => return self.all_rows.read().clone(),
                };
                for child in children {
                    if acc.is_empty() {
                        break;
                    }
                    acc &= self.evaluate_rows(child);
                }
                acc
            }
            TagFilter::Or(children) => {
                let universe = self.all_rows.read().len();
                let mut acc = RoaringBitmap::new();
                for child in children {
                    if acc.len() == universe && universe > 0 {
                        break;
                    }
                    acc |= self.evaluate_rows(child);
                }
                acc
            }
        }
    }

    /// Series matched by a filter tree
    pub fn evaluate(&self, filter: &TagFilter, resolver: &dyn RowKeyResolver) -> HashSet<SeriesKey> {
        self.evaluate_rows(filter)
            .iter()
            .filter_map(|row| resolver.series_key(row))
            .collect()
    }

    /// Tag keys in sorted order
    pub fn get_tag_keys(&self) -> Vec<String> {
        self.index.iter().map(|e| e.key().clone()).collect()
    }

    /// Values seen for a tag key, in sorted order
    pub fn get_tag_values(&self, key: &str) -> Vec<String> {
        self.index
            .get(key)
            .map(|values| values.value().iter().map(|e| e.key().clone()).collect())
            .unwrap_or_default()
    }

    /// Every indexed key/value pair
    pub fn get_tags(&self) -> Vec<Tag> {
        let mut tags = Vec::new();
        for values in self.index.iter() {
            for value in values.value().iter() {
                tags.push(Tag::new(values.key().clone(), value.key().clone()));
            }
        }
        tags
    }

    /// Approximate in-memory footprint
    pub fn size_in_bytes(&self) -> usize {
        let mut size = 0;
        for values in self.index.iter() {
            size += values.key().len();
            for value in values.value().iter() {
                size += value.key().len() + value.value().read().serialized_size();
            }
        }
        size
    }

    pub fn measurement(&self) -> &str {
        &self.measurement
    }

    /// Flush the reverse log
    pub fn close(&self) -> Result<()> {
        self.rev_log.flush()?;
        info!("Closed tag index for {}", self.measurement);
        Ok(())
    }
}
