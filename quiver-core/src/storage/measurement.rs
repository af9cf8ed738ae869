//! Measurement - the series registry of one measurement
//!
//! On disk a measurement is:
//!
//! ```text
//! <data_dir>/<name>.manifest.json   db name, measurement, bucket size
//! <data_dir>/<name>.series          series log (row -> series key)
//! <data_dir>/<name>.ptr             allocator pointer log
//! <data_dir>/<name>_<n>.data        segment data files
//! <index_dir>/<name>.rev            tag index reverse log
//! ```
//!
//! A new series is written to the series log, then indexed, then published.
//! Segments find their series again through the row stored in their pointer
//! record.

use super::field::{FieldBucket, Segment};
use super::predicate::Predicate;
use super::series::Series;
use super::{bucket_id, MeasurementConfig, SegmentConfig};
use crate::compaction::CompactionService;
use crate::compression::Writer;
use crate::index::{RowKeyResolver, TagFilter, TagIndex};
use crate::malloc::{BufferId, Malloc, MallocStats};
use crate::wal::{SeriesEntry, SeriesLogReader, SeriesLogWriter};
use crate::{
    DataPoint, DbMetadata, FieldValue, Point, QuiverError, Result, SeriesKey, SeriesOutput, Tag,
    Timestamp,
};
use crossbeam_skiplist::SkipMap;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

/// Persisted identity of a measurement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Manifest {
    db_name: String,
    measurement: String,
    bucket_size_secs: u32,
}

impl Manifest {
    /// Load the manifest, writing `fresh` if there is none yet
    fn load_or_create(path: &Path, fresh: Manifest) -> Result<Manifest> {
        if path.exists() {
            let manifest: Manifest = serde_json::from_slice(&fs::read(path)?)?;
            return Ok(manifest);
        }
        fs::write(path, serde_json::to_vec_pretty(&fresh)?)?;
        Ok(fresh)
    }
}

/// Measurement statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementStats {
    pub series_count: usize,
    pub field_count: usize,
    pub segment_count: usize,
    /// Approximate in-memory size of the tag index
    pub index_bytes: usize,
    pub malloc: MallocStats,
}

/// One measurement: its series, their tag index and their segment storage
pub struct Measurement {
    db_name: String,
    name: String,
    config: MeasurementConfig,
    segment_config: SegmentConfig,
    index: TagIndex,
    malloc: Malloc,
    series_log: SeriesLogWriter,
    /// Series by row index
    series_list: RwLock<Vec<Arc<Series>>>,
    series_map: SkipMap<SeriesKey, Arc<Series>>,
    /// Serializes series creation, compaction and garbage collection
    lock: Mutex<()>,
    retention_hours: AtomicU32,
    service: Mutex<Option<CompactionService>>,
    closed: AtomicBool,
}

fn sorted_tags(tags: &[Tag], pre_sorted: bool) -> Cow<'_, [Tag]> {
    if pre_sorted {
        Cow::Borrowed(tags)
    } else {
        let mut owned = tags.to_vec();
        owned.sort();
        Cow::Owned(owned)
    }
}

impl Measurement {
    /// Parse `options` and open the measurement. See [`Measurement::open`].
    #[allow(clippy::too_many_arguments)]
    pub fn configure(
        options: &HashMap<String, String>,
        bucket_size_secs: u32,
        db_name: &str,
        name: &str,
        index_dir: &Path,
        data_dir: &Path,
        metadata: DbMetadata,
        scheduler: Option<Handle>,
    ) -> Result<Arc<Self>> {
        let config = MeasurementConfig::from_options(options, bucket_size_secs)?;
        Self::open(config, db_name, name, index_dir, data_dir, metadata, scheduler)
    }

    /// Open or recover a measurement.
    ///
    /// Replays the tag index, the allocator and the series log, reattaches
    /// every recovered segment to its field and releases buffers nothing owns.
    /// With a `scheduler` and compaction enabled, background compaction and
    /// garbage collection start on that runtime.
    pub fn open(
        mut config: MeasurementConfig,
        db_name: &str,
        name: &str,
        index_dir: &Path,
        data_dir: &Path,
        metadata: DbMetadata,
        scheduler: Option<Handle>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        fs::create_dir_all(data_dir)?;

        let manifest = Manifest::load_or_create(
            &data_dir.join(format!("{}.manifest.json", name)),
            Manifest {
                db_name: db_name.to_string(),
                measurement: name.to_string(),
                bucket_size_secs: config.bucket_size_secs,
            },
        )?;
        if manifest.bucket_size_secs != config.bucket_size_secs {
            info!(
                "Measurement {} keeps its bucket size of {}s (requested {}s)",
                name, manifest.bucket_size_secs, config.bucket_size_secs
            );
            config.bucket_size_secs = manifest.bucket_size_secs;
            config.validate()?;
        }

        let index = TagIndex::open(index_dir, name)?;
        let (malloc, recovered) = Malloc::open(data_dir, name, config.malloc)?;

        // Series
        let series_path = data_dir.join(format!("{}.series", name));
        let (entries, valid_len) = SeriesLogReader::recover(&series_path)?;
        let mut series_list: Vec<Arc<Series>> = Vec::with_capacity(entries.len());
        let series_map = SkipMap::new();
        for entry in entries {
            let row = entry.row as usize;
            if row > series_list.len() {
                return Err(QuiverError::Corruption(format!(
                    "series log of {} skips from row {} to {}",
                    name,
                    series_list.len(),
                    row
                )));
            }
            if let Some(existing) = series_list.get(row) {
                if existing.key() != &entry.key {
                    return Err(QuiverError::Corruption(format!(
                        "series log of {} assigns row {} to both {} and {}",
                        name,
                        row,
                        existing.key(),
                        entry.key
                    )));
                }
                warn!("Series log of {} repeats row {}", name, row);
                continue;
            }
            let tags = entry.key.decode_tags()?;
            index.index_tags(&tags, entry.row)?;
            let series = Arc::new(Series::new(entry.row, entry.key.clone(), tags));
            series_list.push(series.clone());
            series_map.insert(entry.key, series);
        }

        // Segments
        let mut release = HashSet::new();
        let mut groups: BTreeMap<(u32, String, i64), Vec<Segment>> = BTreeMap::new();
        let recovered_count = recovered.len();
        for buffer in recovered {
            let tag = buffer.tag;
            if series_list.get(tag.row as usize).is_none() {
                warn!("Releasing buffer {} of unknown row {}", buffer.id, tag.row);
                release.insert(buffer.id);
                continue;
            }
            let Some(writer) = Writer::resume(buffer.id, buffer.region)? else {
                warn!("Releasing uninitialized buffer {}", buffer.id);
                release.insert(buffer.id);
                continue;
            };
            groups
                .entry((tag.row, tag.field, tag.bucket))
                .or_default()
                .push(Segment {
                    writer,
                    seq: tag.seq,
                    base_seq: tag.base_seq,
                });
        }
        for ((row, field, bucket), segments) in groups {
            let fp = segments.first().map_or(false, |s| s.writer.is_fp());
            let field = series_list[row as usize].get_or_create_field(&field, fp);
            release.extend(field.restore(bucket, segments)?);
        }
        let released = malloc.cleanup_buffer_ids(&release)?;

        let series_log = SeriesLogWriter::open(&series_path, valid_len)?;
        info!(
            "Opened measurement {}.{}: {} series, {} buffers recovered, {} released",
            db_name,
            name,
            series_list.len(),
            recovered_count,
            released
        );

        let segment_config = SegmentConfig {
            codec: config.codec,
            buffer_size: config.buffer_size,
            bucket_size_secs: config.bucket_size_secs,
        };
        let measurement = Arc::new(Self {
            db_name: db_name.to_string(),
            name: name.to_string(),
            config,
            segment_config,
            index,
            malloc,
            series_log,
            series_list: RwLock::new(series_list),
            series_map,
            lock: Mutex::new(()),
            retention_hours: AtomicU32::new(metadata.retention_hours),
            service: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        if measurement.config.compaction_enabled {
            if let Some(runtime) = scheduler {
                let service = CompactionService::start(
                    &measurement,
                    &runtime,
                    measurement.config.compaction_frequency,
                    measurement.config.gc_frequency,
                );
                *measurement.service.lock() = Some(service);
            }
        }
        Ok(measurement)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(QuiverError::Internal(format!(
                "measurement {} is closed",
                self.name
            )));
        }
        Ok(())
    }

    /// Existing series for `tags`, without creating one
    pub fn get_series(&self, tags: &[Tag], pre_sorted: bool) -> Option<Arc<Series>> {
        let tags = sorted_tags(tags, pre_sorted);
        let key = SeriesKey::from_sorted_tags(&tags);
        self.series_map.get(&key).map(|e| e.value().clone())
    }

    /// Series for `tags`, created on first use. Tags are sorted unless the
    /// caller asserts they already are; every permutation of a tag set maps to
    /// the same series.
    pub fn get_or_create_series(&self, tags: &[Tag], pre_sorted: bool) -> Result<Arc<Series>> {
        let tags = sorted_tags(tags, pre_sorted);
        let key = SeriesKey::from_sorted_tags(&tags);
        if let Some(entry) = self.series_map.get(&key) {
            return Ok(entry.value().clone());
        }

        let _guard = self.lock.lock();
        if let Some(entry) = self.series_map.get(&key) {
            return Ok(entry.value().clone());
        }
        self.check_open()?;
        for tag in tags.iter() {
            tag.validate()?;
        }

        let row = self.series_list.read().len() as u32;
        self.series_log.append(&SeriesEntry::new(row, key.clone()))?;
        self.index.index_tags(&tags, row)?;

        let series = Arc::new(Series::new(row, key.clone(), tags.into_owned()));
        self.series_list.write().push(series.clone());
        self.series_map.insert(key, series.clone());
        debug!("Created series {} row {} in {}", series.key(), row, self.name);
        Ok(series)
    }

    /// Append one value of `field` to the series of `tags`
    pub fn ingest(
        &self,
        field: &str,
        tags: &[Tag],
        timestamp: Timestamp,
        value: FieldValue,
        pre_sorted: bool,
    ) -> Result<()> {
        self.check_open()?;
        let series = self.get_or_create_series(tags, pre_sorted)?;
        series.append(&self.malloc, &self.segment_config, field, timestamp, value)
    }

    /// Append every field of a point
    pub fn ingest_point(&self, point: &Point) -> Result<()> {
        self.check_open()?;
        let series = self.get_or_create_series(&point.tags, false)?;
        for (field, value) in &point.fields {
            series.append(&self.malloc, &self.segment_config, field, point.timestamp, *value)?;
        }
        Ok(())
    }

    /// Read every field matching `field_pattern` (a regular expression matched
    /// against the whole field name) in `[start, end]` from the series selected
    /// by `tag_filter`, or from all series.
    ///
    /// Returns one output per matching (series, field) pair, with an empty point
    /// list when nothing falls in range. Output order across series is
    /// unspecified.
    pub fn query(
        &self,
        field_pattern: &str,
        start: Timestamp,
        end: Timestamp,
        tag_filter: Option<&TagFilter>,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<SeriesOutput>> {
        let fields = Regex::new(&format!("^(?:{})$", field_pattern)).map_err(|e| {
            QuiverError::Query(format!("invalid field pattern {:?}: {}", field_pattern, e))
        })?;

        let candidates: Vec<Arc<Series>> = match tag_filter {
            Some(filter) => {
                let rows = self.index.evaluate_rows(filter);
                let list = self.series_list.read();
                rows.iter()
                    .filter_map(|row| list.get(row as usize).cloned())
                    .collect()
            }
            None => self.series_list.read().clone(),
        };

        let read = |series: &Arc<Series>| self.query_series(series, &fields, start, end, predicate);
        let outputs: Vec<Vec<SeriesOutput>> = if self.config.use_query_pool {
            candidates.par_iter().map(read).collect::<Result<_>>()?
        } else {
            candidates.iter().map(read).collect::<Result<_>>()?
        };
        Ok(outputs.into_iter().flatten().collect())
    }

    fn query_series(
        &self,
        series: &Series,
        fields: &Regex,
        start: Timestamp,
        end: Timestamp,
        predicate: Option<&Predicate>,
    ) -> Result<Vec<SeriesOutput>> {
        let mut outputs = Vec::new();
        for field in series.fields() {
            if !fields.is_match(field.name()) {
                continue;
            }
            let points =
                field.query_range(start, end, predicate, self.segment_config.bucket_size_secs)?;
            outputs.push(SeriesOutput {
                measurement: self.name.clone(),
                field: field.name().to_string(),
                tags: series.tags().to_vec(),
                fp: field.is_fp(),
                points,
            });
        }
        Ok(outputs)
    }

    /// Compact every series and release the superseded buffers.
    ///
    /// A failing series is logged and skipped; buffers it already replaced
    /// are still released. Returns the released buffer ids.
    pub fn compact(&self) -> Result<HashSet<BufferId>> {
        let _guard = self.lock.lock();
        self.check_open()?;
        let series: Vec<Arc<Series>> = self.series_list.read().clone();

        let mut superseded = HashSet::new();
        let mut buckets = 0;
        let mut failed = 0;
        for s in &series {
            match s.compact(
                &self.malloc,
                &self.segment_config,
                self.config.compaction_ratio,
                &mut superseded,
            ) {
                Ok(n) => buckets += n,
                Err(e) => {
                    failed += 1;
                    error!("Compaction of series {} in {} failed: {}", s.key(), self.name, e);
                }
            }
        }

        let cleaned = self.malloc.cleanup_buffer_ids(&superseded)?;
        info!(
            "Compacted {}: buckets={} failed_series={} cleaned={}",
            self.name, buckets, failed, cleaned
        );
        Ok(superseded)
    }

    /// Number of time buckets kept by garbage collection
    pub fn retention_buckets(&self) -> u64 {
        let secs = self.retention_hours.load(Ordering::Relaxed) as u64 * 3600;
        secs.div_ceil(self.segment_config.bucket_size_secs as u64).max(1)
    }

    /// Evict buckets older than the retention window, measured back from the
    /// newest bucket of the measurement. Returns the number of released buffers.
    pub fn collect_garbage(&self) -> Result<usize> {
        let _guard = self.lock.lock();
        self.check_open()?;
        let series: Vec<Arc<Series>> = self.series_list.read().clone();

        let Some(newest) = series.iter().filter_map(|s| s.newest_bucket()).max() else {
            return Ok(0);
        };
        let keep = self.retention_buckets().min(i64::MAX as u64) as i64;
        let oldest_kept = newest.saturating_sub(keep - 1);

        let mut released = HashSet::new();
        let evicted: usize = series
            .iter()
            .map(|s| s.evict_before(oldest_kept, &mut released))
            .sum();
        let cleaned = self.malloc.cleanup_buffer_ids(&released)?;
        info!(
            "Collected garbage in {}: buckets={} cleaned={}",
            self.name, evicted, cleaned
        );
        Ok(cleaned)
    }

    pub fn set_retention_hours(&self, hours: u32) {
        self.retention_hours.store(hours, Ordering::Relaxed);
    }

    pub fn retention_hours(&self) -> u32 {
        self.retention_hours.load(Ordering::Relaxed)
    }

    /// Stop background work and flush every log and data file. Idempotent.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(service) = self.service.lock().take() {
            service.stop();
        }
        let _guard = self.lock.lock();
        self.series_log.sync()?;
        self.malloc.close()?;
        self.index.close()?;
        info!("Closed measurement {}.{}", self.db_name, self.name);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    pub fn config(&self) -> &MeasurementConfig {
        &self.config
    }

    /// Bucket size in effect, which may come from the manifest
    pub fn bucket_size_secs(&self) -> u32 {
        self.segment_config.bucket_size_secs
    }

    pub fn tag_index(&self) -> &TagIndex {
        &self.index
    }

    pub fn series_count(&self) -> usize {
        self.series_list.read().len()
    }

    /// Series keys in row order
    pub fn get_series_keys(&self) -> Vec<SeriesKey> {
        self.series_list.read().iter().map(|s| s.key().clone()).collect()
    }

    /// Field storage of an existing series
    pub fn get_series_field(
        &self,
        tags: &[Tag],
        field: &str,
        pre_sorted: bool,
    ) -> Option<Arc<FieldBucket>> {
        self.get_series(tags, pre_sorted)?.field(field)
    }

    /// Points of one field of one existing series in `[start, end]`
    pub fn read_series_field(
        &self,
        tags: &[Tag],
        field: &str,
        start: Timestamp,
        end: Timestamp,
        predicate: Option<&Predicate>,
        pre_sorted: bool,
    ) -> Result<Vec<DataPoint>> {
        let tags = sorted_tags(tags, pre_sorted);
        let series = self.get_series(&tags, true).ok_or_else(|| {
            QuiverError::SeriesNotFound(SeriesKey::from_sorted_tags(&tags).to_string())
        })?;
        let bucket = series.field(field).ok_or_else(|| {
            QuiverError::SeriesNotFound(format!("{} has no field {}", series.key(), field))
        })?;
        bucket.query_range(start, end, predicate, self.segment_config.bucket_size_secs)
    }

    /// Field names used by any series, sorted
    pub fn get_fields_for_measurement(&self) -> Vec<String> {
        let mut names = BTreeSet::new();
        for series in self.series_list.read().iter() {
            names.extend(series.field_names());
        }
        names.into_iter().collect()
    }

    /// Whether `field` is floating point, from the first series that has it
    pub fn is_field_fp(&self, field: &str) -> Option<bool> {
        self.series_list
            .read()
            .iter()
            .find_map(|s| s.field(field).map(|f| f.is_fp()))
    }

    pub fn get_tag_keys(&self) -> Vec<String> {
        self.index.get_tag_keys()
    }

    pub fn get_tag_values(&self, key: &str) -> Vec<String> {
        self.index.get_tag_values(key)
    }

    pub fn get_tags_for_measurement(&self) -> Vec<Tag> {
        self.index.get_tags()
    }

    /// Series carrying `key=value`
    pub fn search_row_keys_for_tag(&self, key: &str, value: &str) -> Vec<SeriesKey> {
        self.index.search_row_keys_for_tag(key, value, self)
    }

    /// Series matched by a tag filter
    pub fn evaluate_filter(&self, filter: &TagFilter) -> HashSet<SeriesKey> {
        self.index.evaluate(filter, self)
    }

    pub fn stats(&self) -> MeasurementStats {
        let list = self.series_list.read();
        MeasurementStats {
            series_count: list.len(),
            field_count: list.iter().map(|s| s.field_names().len()).sum(),
            segment_count: list.iter().map(|s| s.segment_count()).sum(),
            index_bytes: self.index.size_in_bytes(),
            malloc: self.malloc.stats(),
        }
    }

    /// Bucket id a timestamp falls into
    pub fn bucket_of(&self, timestamp: Timestamp) -> i64 {
        bucket_id(timestamp, self.segment_config.bucket_size_secs)
    }
}

impl RowKeyResolver for Measurement {
    fn series_key(&self, row: u32) -> Option<SeriesKey> {
        self.series_list
            .read()
            .get(row as usize)
            .map(|s| s.key().clone())
    }
}
