//! Segment readers and reader chains

use super::bitstream::BitReader;
use super::timestamp::TimestampDecompressor;
use super::value::{ValueCodec, ValueDecompressor};
use super::{FLAG_FP, SEGMENT_HEADER_LEN};
use crate::{DataPoint, FieldValue, QuiverError, Result, Timestamp};
use bytes::Bytes;

/// Decoder over a snapshot of one segment
#[derive(Debug, Clone)]
pub struct Reader {
    fp: bool,
    input: BitReader,
    timestamps: Option<TimestampDecompressor>,
    values: ValueDecompressor,
    exhausted: bool,
}

impl Reader {
    /// Parse the segment header at the front of `data`
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < SEGMENT_HEADER_LEN {
            return Err(QuiverError::Corruption(format!(
                "segment snapshot of {} bytes has no header",
                data.len()
            )));
        }
        let codec = ValueCodec::try_from(data[0])?;
        let fp = data[1] & FLAG_FP != 0;
        let mut input = BitReader::at_offset(data, SEGMENT_HEADER_LEN);
        let timestamps = TimestampDecompressor::new(&mut input);

        Ok(Self {
            fp,
            input,
            exhausted: timestamps.is_none(),
            timestamps,
            values: ValueDecompressor::new(codec),
        })
    }

    pub fn is_fp(&self) -> bool {
        self.fp
    }

    /// Next point, or `Ok(None)` at the end of the segment
    pub fn next_point(&mut self) -> Result<Option<DataPoint>> {
        if self.exhausted {
            return Ok(None);
        }
        let Some(timestamps) = self.timestamps.as_mut() else {
            self.exhausted = true;
            return Ok(None);
        };
        let Some(timestamp) = timestamps.read(&mut self.input) else {
            self.exhausted = true;
            return Ok(None);
        };
        let Some(bits) = self.values.read(&mut self.input) else {
            // Torn tail: the timestamp made it to disk, its value did not
            self.exhausted = true;
            return Ok(None);
        };
        Ok(Some(DataPoint {
            timestamp,
            value: FieldValue::from_bits(bits, self.fp),
        }))
    }
}

/// Several segment readers consumed one after another as one sequence,
/// restricted to `[start, end]`.
///
/// Each segment is decoded until it is exhausted or yields a timestamp past
/// `end`, then the chain moves on to the next segment. Decoding errors are
/// returned as they are.
pub struct ReaderChain {
    readers: std::vec::IntoIter<Reader>,
    current: Option<Reader>,
    start: Timestamp,
    end: Timestamp,
}

impl ReaderChain {
    pub fn new(readers: Vec<Reader>, start: Timestamp, end: Timestamp) -> Self {
        let mut readers = readers.into_iter();
        let current = readers.next();
        Self {
            readers,
            current,
            start,
            end,
        }
    }

    /// Next point within range, or `Ok(None)` once every segment is exhausted
    pub fn next_point(&mut self) -> Result<Option<DataPoint>> {
        while let Some(reader) = self.current.as_mut() {
            match reader.next_point()? {
                Some(point) if point.timestamp > self.end => {
                    self.current = self.readers.next();
                }
                Some(point) if point.timestamp < self.start => continue,
                Some(point) => return Ok(Some(point)),
                None => self.current = self.readers.next(),
            }
        }
        Ok(None)
    }
}

impl Iterator for ReaderChain {
    type Item = Result<DataPoint>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_point().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::bitstream::BitWriter;
    use crate::compression::timestamp::TimestampCompressor;
    use crate::compression::value::ValueCompressor;

    fn segment(points: &[(Timestamp, i64)]) -> Bytes {
        let mut out = BitWriter::new();
        let mut ts = TimestampCompressor::new(0, &mut out);
        let mut values = ValueCompressor::new(ValueCodec::Delta);
        for (t, v) in points {
            ts.compress(*t, &mut out).unwrap();
            values.compress(*v as u64, &mut out);
        }
        ts.write_end_of_stream(&mut out);
        let mut data = vec![ValueCodec::Delta.id(), 0, 0, 0];
        data.extend(out.finish());
        Bytes::from(data)
    }

    fn collect(chain: ReaderChain) -> Vec<(Timestamp, i64)> {
        chain
            .map(|p| {
                let p = p.unwrap();
                (p.timestamp, p.value.as_i64())
            })
            .collect()
    }

    #[test]
    fn test_chain_fails_over() {
        let first = Reader::new(segment(&[(10, 1), (20, 2)])).unwrap();
        let second = Reader::new(segment(&[(30, 3), (40, 4)])).unwrap();
        let chain = ReaderChain::new(vec![first, second], 0, 100);
        assert_eq!(collect(chain), vec![(10, 1), (20, 2), (30, 3), (40, 4)]);
    }

    #[test]
    fn test_chain_range() {
        let first = Reader::new(segment(&[(10, 1), (20, 2), (30, 3)])).unwrap();
        let second = Reader::new(segment(&[(15, 5), (25, 6), (35, 7)])).unwrap();
        let chain = ReaderChain::new(vec![first, second], 15, 25);
        assert_eq!(collect(chain), vec![(20, 2), (15, 5), (25, 6)]);
    }

    #[test]
    fn test_bad_header() {
        assert!(Reader::new(Bytes::from_static(&[1, 0])).is_err());
        assert!(Reader::new(Bytes::from_static(&[7, 0, 0, 0, 0])).is_err());

        // Header only: no block start yet
        let mut reader = Reader::new(Bytes::from_static(&[1, 0, 0, 0])).unwrap();
        assert!(reader.next_point().unwrap().is_none());
    }
}
