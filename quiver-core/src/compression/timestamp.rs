//! Delta-of-delta timestamp compression
//!
//! Stream layout:
//! - 64 bits: block start timestamp
//! - 27 bits: first timestamp minus block start (all ones marks an empty stream)
//! - per following point, the delta-of-delta under a prefix code:
//!
//! | prefix | payload | meaning |
//! |--------|---------|---------|
//! | `0`    | -       | same delta as before |
//! | `10`   | 7 bits  | `zigzag(dod) - 1` |
//! | `110`  | 9 bits  | `zigzag(dod) - 1` |
//! | `1110` | 12 bits | `zigzag(dod) - 1` |
//! | `1111` | 32 bits | `zigzag(dod) - 1`, all ones marks end of stream |

use super::bitstream::{BitReader, BitWriter};
use crate::{QuiverError, Result, Timestamp};

/// Width of the first delta field
pub const FIRST_DELTA_BITS: usize = 27;

/// First-delta value reserved as the empty-stream marker
pub const FIRST_DELTA_EOS: u64 = (1 << FIRST_DELTA_BITS) - 1;

/// 32-bit payload reserved as the end-of-stream marker
const EOS_32: u64 = 0xFFFF_FFFF;

/// Largest number of bits a single timestamp can take
pub const MAX_TIMESTAMP_BITS: usize = 4 + 32;

/// Encoder/decoder state shared by the compressor and decompressor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampState {
    pub block_timestamp: Timestamp,
    pub stored_timestamp: Timestamp,
    pub stored_delta: i64,
    pub count: usize,
}

/// Encode a signed 32-bit value so small magnitudes map to small unsigned values
#[inline]
pub fn encode_zigzag32(n: i32) -> u32 {
    ((n << 1) ^ (n >> 31)) as u32
}

/// Inverse of [`encode_zigzag32`]
#[inline]
pub fn decode_zigzag32(n: u32) -> i32 {
    ((n >> 1) as i32) ^ -((n & 1) as i32)
}

/// Timestamp compressor writing into a [`BitWriter`]
#[derive(Debug, Clone)]
pub struct TimestampCompressor {
    state: TimestampState,
}

impl TimestampCompressor {
    /// Start a new stream, writing the block header
    pub fn new(block_timestamp: Timestamp, out: &mut BitWriter) -> Self {
        out.write_bits(block_timestamp as u64, 64);
        Self {
            state: TimestampState {
                block_timestamp,
                ..Default::default()
            },
        }
    }

    /// Continue a stream whose header and points were already written
    pub fn resume(state: TimestampState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> TimestampState {
        self.state
    }

    /// Encode the next timestamp
    pub fn compress(&mut self, timestamp: Timestamp, out: &mut BitWriter) -> Result<()> {
        if self.state.count == 0 {
            let delta = timestamp - self.state.block_timestamp;
            if delta < 0 || delta as u64 >= FIRST_DELTA_EOS {
                return Err(QuiverError::Compression(format!(
                    "timestamp {} is outside the block starting at {}",
                    timestamp, self.state.block_timestamp
                )));
            }
            out.write_bits(delta as u64, FIRST_DELTA_BITS);
            self.state.stored_delta = delta;
        } else {
            let delta = timestamp - self.state.stored_timestamp;
            let delta_of_delta = delta - self.state.stored_delta;
            let dod = i32::try_from(delta_of_delta).map_err(|_| {
                QuiverError::Compression(format!(
                    "delta-of-delta {} does not fit in 32 bits",
                    delta_of_delta
                ))
            })?;

            if dod == 0 {
                out.write_bit(false);
            } else {
                let encoded = (encode_zigzag32(dod) - 1) as u64;
                if encoded < 1 << 7 {
                    out.write_bits(0b10, 2);
                    out.write_bits(encoded, 7);
                } else if encoded < 1 << 9 {
                    out.write_bits(0b110, 3);
                    out.write_bits(encoded, 9);
                } else if encoded < 1 << 12 {
                    out.write_bits(0b1110, 4);
                    out.write_bits(encoded, 12);
                } else {
                    out.write_bits(0b1111, 4);
                    out.write_bits(encoded, 32);
                }
            }
            self.state.stored_delta = delta;
        }
        self.state.stored_timestamp = timestamp;
        self.state.count += 1;
        Ok(())
    }

    /// Append the end-of-stream marker for the current position
    pub fn write_end_of_stream(&self, out: &mut BitWriter) {
        if self.state.count == 0 {
            out.write_bits(FIRST_DELTA_EOS, FIRST_DELTA_BITS);
        } else {
            out.write_bits(0b1111, 4);
            out.write_bits(EOS_32, 32);
        }
    }
}

/// Timestamp decompressor reading from a [`BitReader`]
#[derive(Debug, Clone)]
pub struct TimestampDecompressor {
    state: TimestampState,
    end_of_stream: bool,
}

impl TimestampDecompressor {
    /// Read the block header. Returns `None` if the header itself is missing.
    pub fn new(input: &mut BitReader) -> Option<Self> {
        let block_timestamp = input.read_bits(64)? as i64;
        Some(Self {
            state: TimestampState {
                block_timestamp,
                ..Default::default()
            },
            end_of_stream: false,
        })
    }

    pub fn state(&self) -> TimestampState {
        self.state
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.end_of_stream
    }

    /// Decode the next timestamp; `None` once the end-of-stream marker or the end
    /// of the readable bytes is reached.
    pub fn read(&mut self, input: &mut BitReader) -> Option<Timestamp> {
        if self.end_of_stream {
            return None;
        }
        let decoded = if self.state.count == 0 {
            self.first(input)
        } else {
            self.next_timestamp(input)
        };
        match decoded {
            Some(ts) => {
                self.state.count += 1;
                Some(ts)
            }
            None => {
                self.end_of_stream = true;
                None
            }
        }
    }

    fn first(&mut self, input: &mut BitReader) -> Option<Timestamp> {
        let delta = input.read_bits(FIRST_DELTA_BITS)?;
        if delta == FIRST_DELTA_EOS {
            return None;
        }
        self.state.stored_delta = delta as i64;
        self.state.stored_timestamp = self.state.block_timestamp + delta as i64;
        Some(self.state.stored_timestamp)
    }

    fn next_timestamp(&mut self, input: &mut BitReader) -> Option<Timestamp> {
        let encoded = match input.read_prefix(4)? {
            0x00 => {
                self.state.stored_timestamp += self.state.stored_delta;
                return Some(self.state.stored_timestamp);
            }
            0x02 => input.read_bits(7)?,
            0x06 => input.read_bits(9)?,
            0x0E => input.read_bits(12)?,
            _ => {
                let v = input.read_bits(32)?;
                if v == EOS_32 {
                    return None;
                }
                v
            }
        };

        let dod = decode_zigzag32((encoded + 1) as u32) as i64;
        self.state.stored_delta += dod;
        self.state.stored_timestamp += self.state.stored_delta;
        Some(self.state.stored_timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(block: i64, timestamps: &[i64]) -> Vec<i64> {
        let mut out = BitWriter::new();
        let mut compressor = TimestampCompressor::new(block, &mut out);
        for ts in timestamps {
            compressor.compress(*ts, &mut out).unwrap();
        }
        compressor.write_end_of_stream(&mut out);

        let mut input = BitReader::new(out.finish());
        let mut decompressor = TimestampDecompressor::new(&mut input).unwrap();
        let mut decoded = Vec::new();
        while let Some(ts) = decompressor.read(&mut input) {
            decoded.push(ts);
        }
        assert!(decompressor.is_end_of_stream());
        decoded
    }

    #[test]
    fn test_zigzag() {
        for n in [0, 1, -1, 63, -64, 255, -256, i32::MAX, i32::MIN] {
            assert_eq!(decode_zigzag32(encode_zigzag32(n)), n);
        }
        assert_eq!(encode_zigzag32(-1), 1);
        assert_eq!(encode_zigzag32(1), 2);
    }

    #[test]
    fn test_constant_delta() {
        let block = 1_497_720_000_000;
        let ts: Vec<i64> = (0..1000).map(|i| block + 500 + i * 1000).collect();
        assert_eq!(roundtrip(block, &ts), ts);
    }

    #[test]
    fn test_bucket_boundaries() {
        // zigzag(dod) - 1 landing on each side of the 7/9/12/32-bit limits
        let dods: Vec<i64> = vec![
            1, -1, 64, -64, 65, -65, 256, -256, 257, -257, 2048, -2048, 2049, -2049,
            100_000, -100_000, i32::MAX as i64, 1, i32::MIN as i64 + 1,
        ];
        let mut ts = vec![10_000_000_000i64, 10_000_000_000 + 1000];
        let mut delta = 1000i64;
        for dod in dods {
            delta += dod;
            let next = ts.last().unwrap() + delta;
            ts.push(next);
        }
        // block start must be close to the first timestamp
        let block_start = ts[0] - 5;
        assert_eq!(roundtrip(block_start, &ts), ts);
    }

    #[test]
    fn test_largest_first_delta() {
        let block = 1_000;
        let ts = vec![block + FIRST_DELTA_EOS as i64 - 1];
        assert_eq!(roundtrip(block, &ts), ts);
    }

    #[test]
    fn test_first_delta_out_of_range() {
        let mut out = BitWriter::new();
        let mut compressor = TimestampCompressor::new(1_000, &mut out);
        assert!(compressor.compress(999, &mut out).is_err());
        assert!(compressor
            .compress(1_000 + FIRST_DELTA_EOS as i64, &mut out)
            .is_err());
    }

    #[test]
    fn test_empty_stream() {
        assert!(roundtrip(42, &[]).is_empty());
    }

    #[test]
    fn test_truncated_stream_is_end() {
        let mut out = BitWriter::new();
        let mut compressor = TimestampCompressor::new(0, &mut out);
        compressor.compress(10, &mut out).unwrap();
        compressor.compress(5_000, &mut out).unwrap();
        let mut bytes = out.finish();
        bytes.truncate(bytes.len() - 1);

        let mut input = BitReader::new(bytes);
        let mut decompressor = TimestampDecompressor::new(&mut input).unwrap();
        assert_eq!(decompressor.read(&mut input), Some(10));
        assert_eq!(decompressor.read(&mut input), None);
        assert_eq!(decompressor.read(&mut input), None);
    }
}
