//! Series - one unique tag set and its fields

use super::field::FieldBucket;
use super::SegmentConfig;
use crate::malloc::{BufferId, Malloc};
use crate::{FieldValue, Result, SeriesKey, Tag, Timestamp};
use crossbeam_skiplist::SkipMap;
use std::collections::HashSet;
use std::sync::Arc;

/// A series of a measurement
pub struct Series {
    key: SeriesKey,
    row: u32,
    tags: Vec<Tag>,
    fields: SkipMap<String, Arc<FieldBucket>>,
}

impl Series {
    pub(crate) fn new(row: u32, key: SeriesKey, tags: Vec<Tag>) -> Self {
        Self {
            key,
            row,
            tags,
            fields: SkipMap::new(),
        }
    }

    pub fn key(&self) -> &SeriesKey {
        &self.key
    }

    /// Dense row index, used as the element id in tag bitmaps
    pub fn row(&self) -> u32 {
        self.row
    }

    /// Sorted tags of the series
    pub fn tags(&self) -> &[Tag] {
        &self.tags
    }

    /// Field storage, created with the encoding of its first value
    pub(crate) fn get_or_create_field(&self, name: &str, fp: bool) -> Arc<FieldBucket> {
        if let Some(entry) = self.fields.get(name) {
            return entry.value().clone();
        }
        let entry = self
            .fields
            .get_or_insert_with(name.to_string(), || Arc::new(FieldBucket::new(self.row, name, fp)));
        entry.value().clone()
    }

    pub fn field(&self, name: &str) -> Option<Arc<FieldBucket>> {
        self.fields.get(name).map(|e| e.value().clone())
    }

    /// Field names in sorted order
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|e| e.key().clone()).collect()
    }

    pub fn fields(&self) -> Vec<Arc<FieldBucket>> {
        self.fields.iter().map(|e| e.value().clone()).collect()
    }

    pub(crate) fn append(
        &self,
        malloc: &Malloc,
        config: &SegmentConfig,
        field: &str,
        timestamp: Timestamp,
        value: FieldValue,
    ) -> Result<()> {
        self.get_or_create_field(field, value.is_fp())
            .append(malloc, config, timestamp, value)
    }

    /// Compact every field. Stops at the first failing field, keeping what
    /// earlier fields already added to `superseded`.
    pub(crate) fn compact(
        &self,
        malloc: &Malloc,
        config: &SegmentConfig,
        ratio: f64,
        superseded: &mut HashSet<BufferId>,
    ) -> Result<usize> {
        let mut compacted = 0;
        for entry in self.fields.iter() {
            compacted += entry.value().compact(malloc, config, ratio, superseded)?;
        }
        Ok(compacted)
    }

    pub(crate) fn evict_before(&self, oldest_kept: i64, released: &mut HashSet<BufferId>) -> usize {
        self.fields
            .iter()
            .map(|e| e.value().evict_before(oldest_kept, released))
            .sum()
    }

    /// Newest bucket across all fields
    pub fn newest_bucket(&self) -> Option<i64> {
        self.fields.iter().filter_map(|e| e.value().newest_bucket()).max()
    }

    pub fn segment_count(&self) -> usize {
        self.fields.iter().map(|e| e.value().segment_count()).sum()
    }
}

impl std::fmt::Debug for Series {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Series")
            .field("key", &self.key)
            .field("row", &self.row)
            .field("fields", &self.field_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::ValueCodec;
    use crate::malloc::MallocConfig;
    use tempfile::TempDir;

    #[test]
    fn test_fields_keep_first_encoding() {
        let dir = TempDir::new().unwrap();
        let (malloc, _) = Malloc::open(dir.path(), "cpu", MallocConfig::default()).unwrap();
        let config = SegmentConfig {
            codec: ValueCodec::Delta,
            buffer_size: 1024,
            bucket_size_secs: 60,
        };
        let mut tags = vec![Tag::new("host", "a")];
        let key = SeriesKey::from_tags(&mut tags);
        let series = Series::new(0, key, tags);

        series.append(&malloc, &config, "usage", 1_000, FieldValue::Float(0.5)).unwrap();
        series.append(&malloc, &config, "usage", 2_000, FieldValue::Integer(2)).unwrap();
        series.append(&malloc, &config, "count", 1_000, FieldValue::Integer(7)).unwrap();

        assert_eq!(series.field_names(), vec!["count", "usage"]);
        let usage = series.field("usage").unwrap();
        assert!(usage.is_fp());
        let points = usage.query_range(0, 10_000, None, 60).unwrap();
        assert_eq!(points[1].value, FieldValue::Float(2.0));
        assert!(!series.field("count").unwrap().is_fp());
        assert_eq!(series.newest_bucket(), Some(0));
        assert_eq!(series.segment_count(), 2);
    }
}
