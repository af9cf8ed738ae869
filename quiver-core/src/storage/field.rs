//! Time-bucketed storage for one field of one series
//!
//! Each time bucket holds an ordered list of segments. Only the last segment
//! accepts appends; when it fills up it is sealed and a new one is allocated
//! in the same bucket. Compaction folds a bucket's segments into one.

use super::predicate::Predicate;
use super::{bucket_id, bucket_start, SegmentConfig};
use crate::compression::{Reader, ReaderChain, Writer};
use crate::malloc::{BufferId, Malloc, SegmentTag};
use crate::{DataPoint, FieldValue, QuiverError, Result, Timestamp};
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Fixed headroom of a compacted segment, plus a little per merged segment
const COMPACTION_SLACK: usize = 64;
const COMPACTION_SLACK_PER_SEGMENT: usize = 16;

pub(crate) struct Segment {
    pub writer: Writer,
    pub seq: u32,
    /// Lowest seq this segment replaces; equals `seq` unless it came out of compaction
    pub base_seq: u32,
}

impl Segment {
    fn is_compacted(&self) -> bool {
        self.base_seq < self.seq
    }
}

#[derive(Default)]
struct TimeBucket {
    segments: Vec<Segment>,
    next_seq: u32,
}

impl TimeBucket {
    /// `settled` buckets no longer receive regular appends
    fn needs_compaction(&self, ratio: f64, settled: bool) -> bool {
        match self.segments.as_slice() {
            [] => false,
            [only] if only.writer.is_read_only() => false,
            segments => {
                let fresh = segments.iter().filter(|s| !s.is_compacted()).count();
                if fresh >= 2 {
                    return true;
                }
                let used: usize = segments.iter().map(|s| s.writer.used_bytes()).sum();
                let capacity: usize = segments.iter().map(|s| s.writer.capacity()).sum();
                settled && (used as f64 * ratio) < capacity as f64
            }
        }
    }
}

/// Storage for one (series, field) pair
pub struct FieldBucket {
    row: u32,
    name: String,
    fp: bool,
    buckets: SkipMap<i64, RwLock<TimeBucket>>,
}

impl FieldBucket {
    pub(crate) fn new(row: u32, name: &str, fp: bool) -> Self {
        Self {
            row,
            name: name.to_string(),
            fp,
            buckets: SkipMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether values are stored as floating point
    pub fn is_fp(&self) -> bool {
        self.fp
    }

    fn allocate_writer(
        &self,
        malloc: &Malloc,
        config: &SegmentConfig,
        bucket: i64,
        seq: u32,
        base_seq: u32,
        size: usize,
    ) -> Result<Writer> {
        let tag = SegmentTag {
            row: self.row,
            field: self.name.clone(),
            bucket,
            seq,
            base_seq,
        };
        let (id, region) = malloc.allocate(&tag, size)?;
        let block = bucket_start(bucket, config.bucket_size_secs);
        match Writer::new(id, region, config.codec, self.fp, block) {
            Ok(writer) => Ok(writer),
            Err(e) => {
                malloc.cleanup_buffer_ids(&HashSet::from([id]))?;
                Err(e)
            }
        }
    }

    /// Append a point to the bucket covering `timestamp`
    pub(crate) fn append(
        &self,
        malloc: &Malloc,
        config: &SegmentConfig,
        timestamp: Timestamp,
        value: FieldValue,
    ) -> Result<()> {
        let id = bucket_id(timestamp, config.bucket_size_secs);
        loop {
            let entry = self
                .buckets
                .get_or_insert_with(id, || RwLock::new(TimeBucket::default()));
            let mut bucket = entry.value().write();
            // Evicted between lookup and lock
            if entry.is_removed() {
                continue;
            }
            return self.append_locked(malloc, config, id, &mut bucket, timestamp, value);
        }
    }

    fn append_locked(
        &self,
        malloc: &Malloc,
        config: &SegmentConfig,
        id: i64,
        bucket: &mut TimeBucket,
        timestamp: Timestamp,
        value: FieldValue,
    ) -> Result<()> {
        let rollover = match bucket.segments.last() {
            Some(active) => !active.writer.has_room(),
            None => true,
        };
        if rollover {
            if let Some(active) = bucket.segments.last_mut() {
                active.writer.mark_read_only()?;
            }
            let seq = bucket.next_seq;
            let writer = self.allocate_writer(malloc, config, id, seq, seq, config.buffer_size)?;
            debug!(
                "New segment {} for row {} field {} bucket {} seq {}",
                writer.id(),
                self.row,
                self.name,
                id,
                seq
            );
            bucket.segments.push(Segment {
                writer,
                seq,
                base_seq: seq,
            });
            bucket.next_seq = seq + 1;
        }

        match bucket.segments.last_mut() {
            Some(active) => active.writer.append(timestamp, value),
            None => Err(QuiverError::Internal("time bucket has no segment".into())),
        }
    }

    /// Lazily read the points in `[start, end]`, bucket by bucket and segment by
    /// segment, keeping those accepted by `predicate`
    pub fn reader<'p>(
        &self,
        start: Timestamp,
        end: Timestamp,
        predicate: Option<&'p Predicate>,
        bucket_size_secs: u32,
    ) -> Result<FieldReaderIterator<'p>> {
        let mut readers: Vec<Reader> = Vec::new();
        if start <= end {
            let first = bucket_id(start, bucket_size_secs);
            let last = bucket_id(end, bucket_size_secs);
            for entry in self.buckets.range(first..=last) {
                let bucket = entry.value().read();
                for segment in &bucket.segments {
                    readers.push(segment.writer.reader()?);
                }
            }
        }
        Ok(FieldReaderIterator {
            chain: ReaderChain::new(readers, start, end),
            predicate,
        })
    }

    /// Collect the points in `[start, end]` accepted by `predicate`
    pub fn query_range(
        &self,
        start: Timestamp,
        end: Timestamp,
        predicate: Option<&Predicate>,
        bucket_size_secs: u32,
    ) -> Result<Vec<DataPoint>> {
        self.reader(start, end, predicate, bucket_size_secs)?.collect()
    }

    /// Fold buckets into single sealed segments. A bucket qualifies when it
    /// holds two or more segments that did not come out of compaction, or when
    /// it is not the newest bucket and its segments fill less than `1 / ratio`
    /// of their regions. Buckets whose segments are not in timestamp order are
    /// left alone, since merging them would change what range reads return.
    ///
    /// Replaced buffers are added to `superseded`, including those of buckets
    /// compacted before an error stops the pass.
    pub(crate) fn compact(
        &self,
        malloc: &Malloc,
        config: &SegmentConfig,
        ratio: f64,
        superseded: &mut HashSet<BufferId>,
    ) -> Result<usize> {
        let newest = self.newest_bucket();
        let mut compacted = 0;
        for entry in self.buckets.iter() {
            let mut bucket = entry.value().write();
            let settled = Some(*entry.key()) != newest;
            if entry.is_removed() || !bucket.needs_compaction(ratio, settled) {
                continue;
            }
            if let Some(replaced) =
                self.compact_bucket(malloc, config, ratio, *entry.key(), &mut bucket)?
            {
                superseded.extend(replaced);
                compacted += 1;
            }
        }
        Ok(compacted)
    }

    fn compact_bucket(
        &self,
        malloc: &Malloc,
        config: &SegmentConfig,
        ratio: f64,
        id: i64,
        bucket: &mut TimeBucket,
    ) -> Result<Option<Vec<BufferId>>> {
        let mut points = Vec::new();
        let mut used = 0;
        for segment in &bucket.segments {
            used += segment.writer.used_bytes();
            let mut reader = segment.writer.reader()?;
            while let Some(point) = reader.next_point()? {
                points.push(point);
            }
        }
        // Range reads stop per segment, so out-of-order segments cannot be merged
        let ordered = points.windows(2).all(|w| w[0].timestamp <= w[1].timestamp);
        if bucket.segments.len() > 1 && !ordered {
            debug!(
                "Skipping compaction of row {} field {} bucket {}: segments out of order",
                self.row, self.name, id
            );
            return Ok(None);
        }

        let slack = COMPACTION_SLACK + COMPACTION_SLACK_PER_SEGMENT * bucket.segments.len();
        let size = ((used as f64 * ratio).ceil() as usize + slack + 7) / 8 * 8;
        let size = size.min(malloc.config().file_max);

        let seq = bucket.next_seq;
        let base_seq = bucket
            .segments
            .iter()
            .map(|s| s.base_seq)
            .min()
            .unwrap_or(seq);
        let mut writer = self.allocate_writer(malloc, config, id, seq, base_seq, size)?;

        for point in &points {
            if let Err(e) = writer.append(point.timestamp, point.value) {
                let abandoned = writer.id();
                malloc.cleanup_buffer_ids(&HashSet::from([abandoned]))?;
                return Err(QuiverError::Compaction(format!(
                    "row {} field {} bucket {}: {} points do not fit {} bytes: {}",
                    self.row,
                    self.name,
                    id,
                    points.len(),
                    size,
                    e
                )));
            }
        }
        // Sealing marks the compacted segment complete for recovery
        writer.mark_read_only()?;

        let replaced: Vec<BufferId> = bucket.segments.iter().map(|s| s.writer.id()).collect();
        debug!(
            "Compacted row {} field {} bucket {}: {} segments, {} points, {} -> {} bytes",
            self.row,
            self.name,
            id,
            replaced.len(),
            points.len(),
            used,
            writer.used_bytes()
        );
        bucket.segments = vec![Segment {
            writer,
            seq,
            base_seq,
        }];
        bucket.next_seq = seq + 1;
        Ok(Some(replaced))
    }

    /// Drop every bucket older than `oldest_kept`, adding its buffers to `released`
    pub(crate) fn evict_before(&self, oldest_kept: i64, released: &mut HashSet<BufferId>) -> usize {
        let mut evicted = 0;
        for entry in self.buckets.range(..oldest_kept) {
            // Unlinked under the bucket lock so a concurrent append retries
            let bucket = entry.value().write();
            released.extend(bucket.segments.iter().map(|s| s.writer.id()));
            entry.remove();
            drop(bucket);
            evicted += 1;
        }
        evicted
    }

    /// Reattach segments recovered from the allocator to bucket `id`.
    ///
    /// Returns the buffers that must be released: inputs of a completed
    /// compaction that were not freed before a crash, and outputs of a
    /// compaction that never finished.
    pub(crate) fn restore(&self, id: i64, segments: Vec<Segment>) -> Result<Vec<BufferId>> {
        let next_seq = segments.iter().map(|s| s.seq + 1).max().unwrap_or(0);
        let (mut segments, dropped) = resolve_segments(segments);

        let last = segments.len().saturating_sub(1);
        for segment in &mut segments[..last] {
            segment.writer.mark_read_only()?;
        }

        let entry = self
            .buckets
            .get_or_insert_with(id, || RwLock::new(TimeBucket::default()));
        let mut bucket = entry.value().write();
        bucket.segments = segments;
        bucket.next_seq = next_seq;
        Ok(dropped)
    }

    /// Newest time bucket holding data
    pub fn newest_bucket(&self) -> Option<i64> {
        self.buckets.back().map(|e| *e.key())
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn segment_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|e| e.value().read().segments.len())
            .sum()
    }

    /// Points stored across all segments
    pub fn point_count(&self) -> usize {
        self.buckets
            .iter()
            .map(|e| {
                e.value()
                    .read()
                    .segments
                    .iter()
                    .map(|s| s.writer.count())
                    .sum::<usize>()
            })
            .sum()
    }
}

/// Order recovered segments by seq and drop those a compaction accounts for
fn resolve_segments(mut segments: Vec<Segment>) -> (Vec<Segment>, Vec<BufferId>) {
    segments.sort_by_key(|s| s.seq);
    let mut dropped = Vec::new();

    // A compacted segment is sealed once complete; anything else is a torn compaction
    segments.retain(|s| {
        let torn = s.is_compacted() && !s.writer.is_read_only();
        if torn {
            warn!("Discarding unfinished compaction output {}", s.writer.id());
            dropped.push(s.writer.id());
        }
        !torn
    });

    let compactions: Vec<(u32, u32)> = segments
        .iter()
        .filter(|s| s.is_compacted())
        .map(|s| (s.base_seq, s.seq))
        .collect();
    segments.retain(|s| {
        let replaced = compactions
            .iter()
            .any(|(base, seq)| *base <= s.seq && s.seq < *seq);
        if replaced {
            dropped.push(s.writer.id());
        }
        !replaced
    });

    (segments, dropped)
}

/// Points of one field in `[start, end]` filtered by an optional predicate
pub struct FieldReaderIterator<'p> {
    chain: ReaderChain,
    predicate: Option<&'p Predicate>,
}

impl Iterator for FieldReaderIterator<'_> {
    type Item = Result<DataPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.chain.next_point() {
                Ok(Some(point)) => {
                    if self.predicate.map_or(true, |p| p.test(point.value)) {
                        return Some(Ok(point));
                    }
                }
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::ValueCodec;
    use crate::malloc::MallocConfig;
    use tempfile::TempDir;

    const BUCKET_SECS: u32 = 4096;

    fn setup(dir: &TempDir) -> (Malloc, SegmentConfig) {
        let (malloc, _) = Malloc::open(dir.path(), "m", MallocConfig::default()).unwrap();
        let config = SegmentConfig {
            codec: ValueCodec::Gorilla,
            buffer_size: 256,
            bucket_size_secs: BUCKET_SECS,
        };
        (malloc, config)
    }

    fn values(points: &[DataPoint]) -> Vec<(Timestamp, i64)> {
        points.iter().map(|p| (p.timestamp, p.value.as_i64())).collect()
    }

    #[test]
    fn test_rollover_and_range_query() {
        let dir = TempDir::new().unwrap();
        let (malloc, config) = setup(&dir);
        let field = FieldBucket::new(0, "value", false);

        let base = 1_497_720_452_566i64;
        for i in 0..2000i64 {
            field
                .append(&malloc, &config, base + i * 1000, FieldValue::Integer(i * 7 % 13))
                .unwrap();
        }
        // 2000 seconds of points cross a 4096s bucket boundary at most once
        assert!(field.bucket_count() <= 2);
        // A 256 byte region holds far fewer than 2000 points
        assert!(field.segment_count() > field.bucket_count());

        let all = field
            .query_range(base, base + 2000 * 1000, None, BUCKET_SECS)
            .unwrap();
        assert_eq!(all.len(), 2000);
        assert!(all.windows(2).all(|w| w[0].timestamp < w[1].timestamp));

        let window = field
            .query_range(base + 100_000, base + 199_000, None, BUCKET_SECS)
            .unwrap();
        assert_eq!(window.len(), 100);
        assert_eq!(window[0].timestamp, base + 100_000);

        let predicate = Predicate::Eq(FieldValue::Integer(0));
        let zeros = field
            .query_range(base, base + 2000 * 1000, Some(&predicate), BUCKET_SECS)
            .unwrap();
        assert_eq!(zeros.len(), 2000 / 13 + 1);

        assert!(field.query_range(10, 5, None, BUCKET_SECS).unwrap().is_empty());
    }

    #[test]
    fn test_compaction_round_trip() {
        let dir = TempDir::new().unwrap();
        let (malloc, config) = setup(&dir);
        let field = FieldBucket::new(0, "value", true);

        let base = 4096 * 1000 * 10;
        for i in 0..500i64 {
            let value = FieldValue::Float((i as f64 * 0.3).sin());
            field.append(&malloc, &config, base + i * 500, value).unwrap();
        }
        let before = field
            .query_range(base, base + 500 * 500, None, BUCKET_SECS)
            .unwrap();
        let segments_before = field.segment_count();
        assert!(segments_before > 1);

        let mut superseded = HashSet::new();
        let compacted = field.compact(&malloc, &config, 1.2, &mut superseded).unwrap();
        assert_eq!(compacted, 1);
        assert_eq!(superseded.len(), segments_before);
        assert_eq!(field.segment_count(), 1);

        let after = field
            .query_range(base, base + 500 * 500, None, BUCKET_SECS)
            .unwrap();
        assert_eq!(before, after);

        // The compacted segment is sealed, so new points start a fresh one
        field
            .append(&malloc, &config, base + 500 * 500, FieldValue::Float(9.0))
            .unwrap();
        assert_eq!(field.segment_count(), 2);
        assert_eq!(field.point_count(), 501);

        // A compacted segment plus the active one is left as is
        let mut again = HashSet::new();
        assert_eq!(field.compact(&malloc, &config, 1.2, &mut again).unwrap(), 0);
        assert!(again.is_empty());
    }

    #[test]
    fn test_evict_before() {
        let dir = TempDir::new().unwrap();
        let (malloc, config) = setup(&dir);
        let field = FieldBucket::new(0, "value", false);
        let bucket_ms = BUCKET_SECS as i64 * 1000;
        for b in 0..5i64 {
            field
                .append(&malloc, &config, b * bucket_ms, FieldValue::Integer(b))
                .unwrap();
        }
        assert_eq!(field.newest_bucket(), Some(4));

        let mut released = HashSet::new();
        assert_eq!(field.evict_before(3, &mut released), 3);
        assert_eq!(released.len(), 3);
        let left = field.query_range(0, 5 * bucket_ms, None, BUCKET_SECS).unwrap();
        assert_eq!(values(&left), vec![(3 * bucket_ms, 3), (4 * bucket_ms, 4)]);
    }

    fn segment(malloc: &Malloc, config: &SegmentConfig, seq: u32, base_seq: u32, sealed: bool) -> Segment {
        let field = FieldBucket::new(0, "value", false);
        let mut writer = field
            .allocate_writer(malloc, config, 0, seq, base_seq, 128)
            .unwrap();
        if sealed {
            writer.mark_read_only().unwrap();
        }
        Segment {
            writer,
            seq,
            base_seq,
        }
    }

    #[test]
    fn test_resolve_segments() {
        let dir = TempDir::new().unwrap();
        let (malloc, config) = setup(&dir);

        // seq 0..=2 compacted into 3, then 4 appended, then a torn compaction 5 of 3..=4
        let recovered = vec![
            segment(&malloc, &config, 4, 4, false),
            segment(&malloc, &config, 0, 0, true),
            segment(&malloc, &config, 3, 0, true),
            segment(&malloc, &config, 1, 1, true),
            segment(&malloc, &config, 5, 0, false),
            segment(&malloc, &config, 2, 2, true),
        ];
        let (kept, dropped) = resolve_segments(recovered);
        let seqs: Vec<u32> = kept.iter().map(|s| s.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(dropped.len(), 4);
    }

    fn active_has_room(field: &FieldBucket, bucket: i64) -> bool {
        field.buckets.get(&bucket).map_or(true, |e| {
            e.value()
                .read()
                .segments
                .last()
                .map_or(true, |s| s.writer.has_room())
        })
    }

    #[test]
    fn test_compaction_keeps_out_of_order_segments() {
        let dir = TempDir::new().unwrap();
        let (malloc, config) = setup(&dir);
        let field = FieldBucket::new(0, "value", false);

        let mut ts = 1000;
        while active_has_room(&field, 0) {
            field
                .append(&malloc, &config, ts, FieldValue::Integer(ts / 1000))
                .unwrap();
            ts += 1000;
        }
        // Late points roll over into a second segment of the same bucket
        for (i, late) in [1500i64, 2500, 3500].iter().enumerate() {
            field
                .append(&malloc, &config, *late, FieldValue::Integer(100 + i as i64))
                .unwrap();
        }
        assert_eq!(field.segment_count(), 2);

        let before = field.query_range(1000, 4000, None, BUCKET_SECS).unwrap();
        assert_eq!(before.len(), 7);
        assert!(before.contains(&DataPoint::new(1500, 100i64)));

        let mut superseded = HashSet::new();
        assert_eq!(field.compact(&malloc, &config, 1.2, &mut superseded).unwrap(), 0);
        assert!(superseded.is_empty());
        assert_eq!(field.segment_count(), 2);

        let after = field.query_range(1000, 4000, None, BUCKET_SECS).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_compaction_shrinks_sparse_settled_bucket() {
        let dir = TempDir::new().unwrap();
        let (malloc, config) = setup(&dir);
        let field = FieldBucket::new(0, "value", false);
        let bucket_ms = BUCKET_SECS as i64 * 1000;
        for i in 0..3i64 {
            field.append(&malloc, &config, i * 1000, FieldValue::Integer(i)).unwrap();
            field
                .append(&malloc, &config, bucket_ms + i * 1000, FieldValue::Integer(i))
                .unwrap();
        }

        // Only the older bucket is rewritten; the newest keeps its active segment
        let mut superseded = HashSet::new();
        assert_eq!(field.compact(&malloc, &config, 1.2, &mut superseded).unwrap(), 1);
        assert_eq!(superseded.len(), 1);
        assert!(active_has_room(&field, 1));
        assert!(!active_has_room(&field, 0));

        let mut again = HashSet::new();
        assert_eq!(field.compact(&malloc, &config, 1.2, &mut again).unwrap(), 0);
        let points = field.query_range(0, 2 * bucket_ms, None, BUCKET_SECS).unwrap();
        assert_eq!(points.len(), 6);
    }

    #[test]
    fn test_eviction_during_ingest() {
        let dir = TempDir::new().unwrap();
        let (malloc, config) = setup(&dir);
        let field = FieldBucket::new(0, "value", false);
        let bucket_ms = BUCKET_SECS as i64 * 1000;

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..2000i64 {
                    // Alternate between an evictable bucket and a kept one
                    let ts = (i % 2) * 5 * bucket_ms + i;
                    field.append(&malloc, &config, ts, FieldValue::Integer(i)).unwrap();
                }
            });
            s.spawn(|| {
                for _ in 0..200 {
                    let mut released = HashSet::new();
                    field.evict_before(1, &mut released);
                    malloc.cleanup_buffer_ids(&released).unwrap();
                    std::thread::yield_now();
                }
            });
        });

        // Every live buffer still belongs to a reachable segment
        assert_eq!(malloc.stats().live_buffers, field.segment_count());
        let kept = field
            .query_range(5 * bucket_ms, 6 * bucket_ms, None, BUCKET_SECS)
            .unwrap();
        assert_eq!(kept.len(), 1000);
    }
}
