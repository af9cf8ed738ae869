//! Value codecs
//!
//! Values are handled as raw 64-bit patterns (see [`crate::FieldValue::to_bits`]).
//! Two codecs are available, chosen per measurement by `disk.compression.class`:
//!
//! - `gorilla`: XOR against the previous value with a leading/trailing-zero window,
//!   best for slowly changing floats.
//! - `delta`: ZigZag-encoded difference with a 6-bit length prefix, best for
//!   integer counters.

use super::bitstream::{BitReader, BitWriter};
use crate::{QuiverError, Result};

/// Largest number of bits a single value can take
pub const MAX_VALUE_BITS: usize = 1 + 1 + 5 + 6 + 64;

/// Value codec selector, persisted in every segment header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ValueCodec {
    Gorilla = 1,
    Delta = 2,
}

impl ValueCodec {
    /// Parse the `disk.compression.class` option
    pub fn from_name(name: &str) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "gorilla" | "xor" => Ok(ValueCodec::Gorilla),
            "delta" | "zigzag" => Ok(ValueCodec::Delta),
            other => Err(QuiverError::Config(format!(
                "unknown compression class '{}'",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ValueCodec::Gorilla => "gorilla",
            ValueCodec::Delta => "delta",
        }
    }

    pub fn id(&self) -> u8 {
        *self as u8
    }
}

impl TryFrom<u8> for ValueCodec {
    type Error = QuiverError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ValueCodec::Gorilla),
            2 => Ok(ValueCodec::Delta),
            _ => Err(QuiverError::Corruption(format!(
                "unknown value codec id {}",
                value
            ))),
        }
    }
}

/// Encoder/decoder state shared by compressor and decompressor
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ValueState {
    pub prev_bits: u64,
    pub prev_leading_zeros: u32,
    pub prev_trailing_zeros: u32,
    pub has_window: bool,
    pub count: usize,
}

#[inline]
fn encode_zigzag64(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

#[inline]
fn decode_zigzag64(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

/// Value compressor
#[derive(Debug, Clone)]
pub struct ValueCompressor {
    codec: ValueCodec,
    state: ValueState,
}

impl ValueCompressor {
    pub fn new(codec: ValueCodec) -> Self {
        Self::resume(codec, ValueState::default())
    }

    /// Continue a stream from recovered state
    pub fn resume(codec: ValueCodec, state: ValueState) -> Self {
        Self { codec, state }
    }

    pub fn state(&self) -> ValueState {
        self.state
    }

    /// Encode the next value
    pub fn compress(&mut self, bits: u64, out: &mut BitWriter) {
        if self.state.count == 0 {
            out.write_bits(bits, 64);
        } else {
            match self.codec {
                ValueCodec::Gorilla => self.compress_xor(bits, out),
                ValueCodec::Delta => self.compress_delta(bits, out),
            }
        }
        self.state.prev_bits = bits;
        self.state.count += 1;
    }

    fn compress_xor(&mut self, bits: u64, out: &mut BitWriter) {
        let xor = bits ^ self.state.prev_bits;
        if xor == 0 {
            out.write_bit(false);
            return;
        }
        out.write_bit(true);

        // Leading zeros are stored in 5 bits
        let leading_zeros = xor.leading_zeros().min(31);
        let trailing_zeros = xor.trailing_zeros();

        if self.state.has_window
            && leading_zeros >= self.state.prev_leading_zeros
            && trailing_zeros >= self.state.prev_trailing_zeros
        {
            out.write_bit(false);
            let meaningful_bits =
                64 - self.state.prev_leading_zeros - self.state.prev_trailing_zeros;
            out.write_bits(xor >> self.state.prev_trailing_zeros, meaningful_bits as usize);
        } else {
            out.write_bit(true);
            let meaningful_bits = 64 - leading_zeros - trailing_zeros;
            out.write_bits(leading_zeros as u64, 5);
            // 64 meaningful bits wraps to 0 in the 6-bit field
            out.write_bits((meaningful_bits & 0x3F) as u64, 6);
            out.write_bits(xor >> trailing_zeros, meaningful_bits as usize);

            self.state.prev_leading_zeros = leading_zeros;
            self.state.prev_trailing_zeros = trailing_zeros;
            self.state.has_window = true;
        }
    }

    fn compress_delta(&mut self, bits: u64, out: &mut BitWriter) {
        let delta = bits.wrapping_sub(self.state.prev_bits) as i64;
        let encoded = encode_zigzag64(delta);
        if encoded == 0 {
            out.write_bit(false);
            return;
        }
        let width = 64 - encoded.leading_zeros();
        out.write_bit(true);
        out.write_bits((width - 1) as u64, 6);
        out.write_bits(encoded, width as usize);
    }
}

/// Value decompressor
#[derive(Debug, Clone)]
pub struct ValueDecompressor {
    codec: ValueCodec,
    state: ValueState,
}

impl ValueDecompressor {
    pub fn new(codec: ValueCodec) -> Self {
        Self {
            codec,
            state: ValueState::default(),
        }
    }

    pub fn state(&self) -> ValueState {
        self.state
    }

    /// Decode the next value; `None` if the input ends mid-value
    pub fn read(&mut self, input: &mut BitReader) -> Option<u64> {
        let bits = if self.state.count == 0 {
            input.read_bits(64)?
        } else {
            match self.codec {
                ValueCodec::Gorilla => self.read_xor(input)?,
                ValueCodec::Delta => self.read_delta(input)?,
            }
        };
        self.state.prev_bits = bits;
        self.state.count += 1;
        Some(bits)
    }

    fn read_xor(&mut self, input: &mut BitReader) -> Option<u64> {
        if !input.read_bit()? {
            return Some(self.state.prev_bits);
        }

        if input.read_bit()? {
            let leading = input.read_bits(5)? as u32;
            let mut meaningful = input.read_bits(6)? as u32;
            if meaningful == 0 {
                meaningful = 64;
            }
            if leading + meaningful > 64 {
                return None;
            }
            self.state.prev_leading_zeros = leading;
            self.state.prev_trailing_zeros = 64 - leading - meaningful;
            self.state.has_window = true;
        }

        let meaningful = 64 - self.state.prev_leading_zeros - self.state.prev_trailing_zeros;
        let value = input.read_bits(meaningful as usize)?;
        let xor = value << self.state.prev_trailing_zeros;
        Some(self.state.prev_bits ^ xor)
    }

    fn read_delta(&mut self, input: &mut BitReader) -> Option<u64> {
        if !input.read_bit()? {
            return Some(self.state.prev_bits);
        }
        let width = input.read_bits(6)? as usize + 1;
        let encoded = input.read_bits(width)?;
        let delta = decode_zigzag64(encoded);
        Some(self.state.prev_bits.wrapping_add(delta as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldValue;

    fn roundtrip(codec: ValueCodec, values: &[u64]) -> Vec<u64> {
        let mut out = BitWriter::new();
        let mut compressor = ValueCompressor::new(codec);
        for v in values {
            compressor.compress(*v, &mut out);
        }
        let mut input = BitReader::new(out.finish());
        let mut decompressor = ValueDecompressor::new(codec);
        (0..values.len())
            .map(|_| decompressor.read(&mut input).unwrap())
            .collect()
    }

    fn float_bits(values: &[f64]) -> Vec<u64> {
        values.iter().map(|v| FieldValue::Float(*v).to_bits(true)).collect()
    }

    #[test]
    fn test_gorilla_floats() {
        let values: Vec<f64> = (0..1000)
            .map(|i| 20.0 + (i as f64 * 0.1).sin() * 5.0)
            .collect();
        let bits = float_bits(&values);
        assert_eq!(roundtrip(ValueCodec::Gorilla, &bits), bits);
    }

    #[test]
    fn test_gorilla_extremes() {
        let bits = vec![0, u64::MAX, 1, 1 << 63, 0, 0x0000_FFFF_0000_0000, 0x0000_FFFF_0000_0001];
        assert_eq!(roundtrip(ValueCodec::Gorilla, &bits), bits);
    }

    #[test]
    fn test_delta_integers() {
        let bits: Vec<u64> = [0i64, 1, 2, 2, -5, i64::MAX, i64::MIN, 7, 7, 1_000_000]
            .iter()
            .map(|v| *v as u64)
            .collect();
        assert_eq!(roundtrip(ValueCodec::Delta, &bits), bits);
    }

    #[test]
    fn test_delta_floats() {
        let bits = float_bits(&[1.5, 2.25, -3.0, 0.0, f64::MAX]);
        assert_eq!(roundtrip(ValueCodec::Delta, &bits), bits);
    }

    #[test]
    fn test_constant_values_are_one_bit() {
        let mut out = BitWriter::new();
        let mut compressor = ValueCompressor::new(ValueCodec::Gorilla);
        for _ in 0..65 {
            compressor.compress(42, &mut out);
        }
        // 64 bits for the first value, one bit for each repeat
        assert_eq!(out.bit_len(), 64 + 64);
    }

    #[test]
    fn test_codec_names() {
        assert_eq!(ValueCodec::from_name("gorilla").unwrap(), ValueCodec::Gorilla);
        assert_eq!(ValueCodec::from_name("DELTA").unwrap(), ValueCodec::Delta);
        assert!(ValueCodec::from_name("lz4").is_err());
        assert_eq!(ValueCodec::try_from(2).unwrap(), ValueCodec::Delta);
        assert!(ValueCodec::try_from(9).is_err());
    }
}
