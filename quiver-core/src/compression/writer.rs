//! Segment writer
//!
//! A segment is one compressed run of points inside a Malloc region:
//!
//! ```text
//! [codec id][flags][0][0] [timestamp/value bit stream ...] [end-of-stream]
//! ```
//!
//! Every append re-writes the trailing partial byte, the new bits and a fresh
//! end-of-stream marker, so the region is decodable after any completed append.

use super::bitstream::{BitReader, BitWriter};
use super::reader::Reader;
use super::timestamp::{TimestampCompressor, TimestampDecompressor, TimestampState};
use super::value::{ValueCodec, ValueCompressor, ValueDecompressor, ValueState};
use super::{FLAG_FP, FLAG_READ_ONLY, MAX_POINT_BYTES, SEGMENT_HEADER_LEN};
use crate::malloc::{BufferId, Region};
use crate::{FieldValue, QuiverError, Result, Timestamp};

/// Append-only compressed segment
#[derive(Debug)]
pub struct Writer {
    id: BufferId,
    region: Region,
    codec: ValueCodec,
    fp: bool,
    read_only: bool,
    timestamps: TimestampCompressor,
    values: ValueCompressor,
    /// Bits not yet folded into `base`: at most the trailing partial byte between appends
    bits: BitWriter,
    /// Bytes of the stream that are final on disk
    base: usize,
    last_timestamp: Option<Timestamp>,
}

impl Writer {
    /// Start a new segment in `region`
    pub fn new(
        id: BufferId,
        region: Region,
        codec: ValueCodec,
        fp: bool,
        block_timestamp: Timestamp,
    ) -> Result<Self> {
        if region.len() < SEGMENT_HEADER_LEN + MAX_POINT_BYTES + 8 {
            return Err(QuiverError::Capacity(format!(
                "region of {} bytes is too small for a segment",
                region.len()
            )));
        }
        let flags = if fp { FLAG_FP } else { 0 };
        region.write(0, &[codec.id(), flags, 0, 0])?;

        let mut bits = BitWriter::with_capacity(MAX_POINT_BYTES + 8);
        let timestamps = TimestampCompressor::new(block_timestamp, &mut bits);
        let mut writer = Self {
            id,
            region,
            codec,
            fp,
            read_only: false,
            timestamps,
            values: ValueCompressor::new(codec),
            bits,
            base: 0,
            last_timestamp: None,
        };
        writer.persist()?;
        Ok(writer)
    }

    /// Rebuild a writer from a region written before a restart.
    ///
    /// The stream is decoded up to its end-of-stream marker (or the first
    /// incomplete point) and encoding resumes exactly there. Returns `None` for a
    /// region whose header was never written.
    pub fn resume(id: BufferId, region: Region) -> Result<Option<Self>> {
        let data = region.read_all();
        let header = &data[..SEGMENT_HEADER_LEN.min(data.len())];
        if header.iter().all(|b| *b == 0) {
            return Ok(None);
        }
        if header.len() < SEGMENT_HEADER_LEN {
            return Err(QuiverError::Corruption(format!(
                "segment {} is shorter than its header",
                id
            )));
        }
        let codec = ValueCodec::try_from(header[0])?;
        let flags = header[1];

        let mut input = BitReader::at_offset(data.clone(), SEGMENT_HEADER_LEN);
        let mut ts_decoder = TimestampDecompressor::new(&mut input).ok_or_else(|| {
            QuiverError::Corruption(format!("segment {} has no block header", id))
        })?;
        let mut value_decoder = ValueDecompressor::new(codec);

        let mut ts_state: TimestampState;
        let mut value_state: ValueState;
        let mut end_bit;
        let mut last_timestamp = None;
        loop {
            ts_state = ts_decoder.state();
            value_state = value_decoder.state();
            end_bit = input.position();
            let Some(ts) = ts_decoder.read(&mut input) else {
                break;
            };
            if value_decoder.read(&mut input).is_none() {
                break;
            }
            last_timestamp = Some(ts);
        }

        let stream_bit = end_bit - SEGMENT_HEADER_LEN * 8;
        let base = stream_bit / 8;
        let partial_bits = (stream_bit % 8) as u8;
        let partial_byte = data
            .get(SEGMENT_HEADER_LEN + base)
            .copied()
            .unwrap_or_default();

        Ok(Some(Self {
            id,
            region,
            codec,
            fp: flags & FLAG_FP != 0,
            read_only: flags & FLAG_READ_ONLY != 0,
            timestamps: TimestampCompressor::resume(ts_state),
            values: ValueCompressor::resume(codec, value_state),
            bits: BitWriter::resume(partial_byte, partial_bits),
            base,
            last_timestamp,
        }))
    }

    /// Write the pending bits plus an end-of-stream marker, then fold the
    /// completed bytes into `base`
    fn persist(&mut self) -> Result<()> {
        let mut scratch = self.bits.clone();
        self.timestamps.write_end_of_stream(&mut scratch);
        self.region
            .write(SEGMENT_HEADER_LEN + self.base, &scratch.snapshot())?;
        self.base += self.bits.drain_complete();
        Ok(())
    }

    /// Whether one more point is guaranteed to fit
    pub fn has_room(&self) -> bool {
        !self.read_only && self.used_bytes() + MAX_POINT_BYTES <= self.region.len()
    }

    /// Append a point. Timestamps should arrive in increasing order; a smaller
    /// one is still encoded but costs more bits.
    pub fn append(&mut self, timestamp: Timestamp, value: FieldValue) -> Result<()> {
        if self.read_only {
            return Err(QuiverError::Internal(format!(
                "segment {} is read-only",
                self.id
            )));
        }
        if !self.has_room() {
            return Err(QuiverError::Capacity(format!("segment {} is full", self.id)));
        }
        self.timestamps.compress(timestamp, &mut self.bits)?;
        self.values.compress(value.to_bits(self.fp), &mut self.bits);
        self.persist()?;
        self.last_timestamp = Some(timestamp);
        Ok(())
    }

    /// Seal the segment; later appends are refused
    pub fn mark_read_only(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        let mut flags = FLAG_READ_ONLY;
        if self.fp {
            flags |= FLAG_FP;
        }
        self.region.write(1, &[flags])?;
        self.read_only = true;
        Ok(())
    }

    /// Open a reader over a snapshot of the points appended so far
    pub fn reader(&self) -> Result<Reader> {
        // Stream so far plus the end-of-stream marker behind it
        let len = self.used_bytes() + MAX_POINT_BYTES;
        Reader::new(self.region.read(0, len))
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn codec(&self) -> ValueCodec {
        self.codec
    }

    pub fn is_fp(&self) -> bool {
        self.fp
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Number of points in the segment
    pub fn count(&self) -> usize {
        self.timestamps.state().count
    }

    pub fn block_timestamp(&self) -> Timestamp {
        self.timestamps.state().block_timestamp
    }

    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.last_timestamp
    }

    /// Header plus encoded stream, excluding the end-of-stream marker
    pub fn used_bytes(&self) -> usize {
        SEGMENT_HEADER_LEN + self.base + self.bits.len()
    }

    /// Region size
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn region(&self) -> &Region {
        &self.region
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::malloc::{Malloc, MallocConfig, SegmentTag};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> (Malloc, Vec<crate::malloc::RecoveredBuffer>) {
        Malloc::open(dir.path(), "cpu", MallocConfig::default()).unwrap()
    }

    fn tag() -> SegmentTag {
        SegmentTag {
            row: 0,
            field: "value".into(),
            bucket: 0,
            seq: 0,
            base_seq: 0,
        }
    }

    fn drain(reader: &mut Reader) -> Vec<(Timestamp, FieldValue)> {
        let mut out = Vec::new();
        while let Some(p) = reader.next_point().unwrap() {
            out.push((p.timestamp, p.value));
        }
        out
    }

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let (malloc, _) = open(&dir);
        let (id, region) = malloc.allocate(&tag(), 4096).unwrap();
        let mut writer = Writer::new(id, region, ValueCodec::Gorilla, true, 0).unwrap();

        assert!(drain(&mut writer.reader().unwrap()).is_empty());

        for i in 0..100 {
            writer.append(i * 1000 + 7, FieldValue::Float(i as f64 / 4.0)).unwrap();
            // Readable after every append
            assert_eq!(drain(&mut writer.reader().unwrap()).len(), i as usize + 1);
        }
        let points = drain(&mut writer.reader().unwrap());
        assert_eq!(points[42], (42_007, FieldValue::Float(10.5)));
        assert_eq!(writer.count(), 100);
    }

    #[test]
    fn test_fills_up() {
        let dir = TempDir::new().unwrap();
        let (malloc, _) = open(&dir);
        let (id, region) = malloc.allocate(&tag(), 128).unwrap();
        let mut writer = Writer::new(id, region, ValueCodec::Delta, false, 0).unwrap();

        let mut written = 0;
        while writer.has_room() {
            writer.append(written * 10, FieldValue::Integer(written * written)).unwrap();
            written += 1;
        }
        assert!(written > 5);
        assert!(writer.append(1_000_000, FieldValue::Integer(0)).unwrap_err().is_capacity());
        assert_eq!(drain(&mut writer.reader().unwrap()).len(), written as usize);
    }

    #[test]
    fn test_resume_continues_stream() {
        let dir = TempDir::new().unwrap();
        let expected: Vec<(Timestamp, FieldValue)> = (0..50)
            .map(|i| (5_000 + i * 250 + (i % 3), FieldValue::Integer(i * 3 - 20)))
            .collect();

        {
            let (malloc, _) = open(&dir);
            let (id, region) = malloc.allocate(&tag(), 4096).unwrap();
            let mut writer = Writer::new(id, region, ValueCodec::Gorilla, false, 5_000).unwrap();
            for (ts, v) in &expected[..30] {
                writer.append(*ts, *v).unwrap();
            }
            malloc.close().unwrap();
        }

        let (_, recovered) = open(&dir);
        let buffer = recovered.into_iter().next().unwrap();
        let mut writer = Writer::resume(buffer.id, buffer.region).unwrap().unwrap();
        assert_eq!(writer.count(), 30);
        assert_eq!(writer.last_timestamp(), Some(expected[29].0));
        assert!(!writer.is_fp());
        for (ts, v) in &expected[30..] {
            writer.append(*ts, *v).unwrap();
        }
        assert_eq!(drain(&mut writer.reader().unwrap()), expected);
    }

    #[test]
    fn test_read_only_survives_resume() {
        let dir = TempDir::new().unwrap();
        let (malloc, _) = open(&dir);
        let (id, region) = malloc.allocate(&tag(), 1024).unwrap();
        let mut writer = Writer::new(id, region.clone(), ValueCodec::Gorilla, true, 0).unwrap();
        writer.append(1, FieldValue::Float(1.0)).unwrap();
        writer.mark_read_only().unwrap();
        assert!(writer.append(2, FieldValue::Float(2.0)).is_err());

        let resumed = Writer::resume(id, region).unwrap().unwrap();
        assert!(resumed.is_read_only());
        assert!(resumed.is_fp());
        assert_eq!(resumed.count(), 1);
    }

    #[test]
    fn test_uninitialized_region() {
        let dir = TempDir::new().unwrap();
        let (malloc, _) = open(&dir);
        let (id, region) = malloc.allocate(&tag(), 1024).unwrap();
        assert!(Writer::resume(id, region.clone()).unwrap().is_none());

        region.write(0, &[9, 0, 0, 0]).unwrap();
        assert!(Writer::resume(id, region).unwrap_err().is_corruption());
    }
}
