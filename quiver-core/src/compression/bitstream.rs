//! Bit-level I/O for the segment codecs

use bytes::Bytes;

/// Bit writer for encoding compressed data
///
/// Completed bytes accumulate in `buffer`; the trailing partial byte is kept in
/// `current_byte` until eight bits have been written.
#[derive(Debug, Clone)]
pub struct BitWriter {
    buffer: Vec<u8>,
    current_byte: u8,
    bit_position: u8,
}

impl BitWriter {
    /// Create a new BitWriter
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            current_byte: 0,
            bit_position: 0,
        }
    }

    /// Create with capacity hint
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            current_byte: 0,
            bit_position: 0,
        }
    }

    /// Resume writing in the middle of a byte.
    ///
    /// Only the top `bit_position` bits of `current_byte` are kept.
    pub fn resume(current_byte: u8, bit_position: u8) -> Self {
        debug_assert!(bit_position < 8);
        let mask = if bit_position == 0 {
            0
        } else {
            0xFFu8 << (8 - bit_position)
        };
        Self {
            buffer: Vec::new(),
            current_byte: current_byte & mask,
            bit_position,
        }
    }

    /// Write a single bit
    #[inline]
    pub fn write_bit(&mut self, bit: bool) {
        if bit {
            self.current_byte |= 1 << (7 - self.bit_position);
        }
        self.bit_position += 1;

        if self.bit_position == 8 {
            self.buffer.push(self.current_byte);
            self.current_byte = 0;
            self.bit_position = 0;
        }
    }

    /// Write multiple bits from a u64 value
    #[inline]
    pub fn write_bits(&mut self, value: u64, num_bits: usize) {
        debug_assert!(num_bits <= 64);

        for i in (0..num_bits).rev() {
            self.write_bit((value >> i) & 1 == 1);
        }
    }

    /// Bytes written so far, including the partial byte, without consuming the writer
    pub fn snapshot(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(&self.buffer);
        if self.bit_position > 0 {
            out.push(self.current_byte);
        }
        out
    }

    /// Drop the completed bytes from the front of the buffer, returning how many
    /// were removed. The partial byte stays in place.
    pub fn drain_complete(&mut self) -> usize {
        let n = self.buffer.len();
        self.buffer.clear();
        n
    }

    /// Finish writing and return the buffer
    pub fn finish(mut self) -> Vec<u8> {
        if self.bit_position > 0 {
            self.buffer.push(self.current_byte);
        }
        self.buffer
    }

    /// Get current size in bytes
    pub fn len(&self) -> usize {
        self.buffer.len() + if self.bit_position > 0 { 1 } else { 0 }
    }

    /// Number of bits written since creation or the last drain
    pub fn bit_len(&self) -> usize {
        self.buffer.len() * 8 + self.bit_position as usize
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.bit_position == 0
    }
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Bit reader for decoding compressed data
#[derive(Debug, Clone)]
pub struct BitReader {
    data: Bytes,
    byte_position: usize,
    bit_position: u8,
}

impl BitReader {
    /// Create a new BitReader
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            byte_position: 0,
            bit_position: 0,
        }
    }

    /// Create a reader positioned at a byte offset
    pub fn at_offset(data: impl Into<Bytes>, byte_offset: usize) -> Self {
        Self {
            data: data.into(),
            byte_position: byte_offset,
            bit_position: 0,
        }
    }

    /// Read a single bit
    #[inline]
    pub fn read_bit(&mut self) -> Option<bool> {
        if self.byte_position >= self.data.len() {
            return None;
        }

        let bit = (self.data[self.byte_position] >> (7 - self.bit_position)) & 1 == 1;
        self.bit_position += 1;

        if self.bit_position == 8 {
            self.byte_position += 1;
            self.bit_position = 0;
        }

        Some(bit)
    }

    /// Read multiple bits as a u64
    #[inline]
    pub fn read_bits(&mut self, num_bits: usize) -> Option<u64> {
        debug_assert!(num_bits <= 64);

        let mut value = 0u64;
        for _ in 0..num_bits {
            let bit = self.read_bit()?;
            value = (value << 1) | (bit as u64);
        }
        Some(value)
    }

    /// Read up to `max_bits` bits, stopping after the first zero bit, and return
    /// the bits read as an integer (`0`, `0b10`, `0b110`, ... or all ones).
    #[inline]
    pub fn read_prefix(&mut self, max_bits: usize) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..max_bits {
            let bit = self.read_bit()?;
            value = (value << 1) | bit as u32;
            if !bit {
                break;
            }
        }
        Some(value)
    }

    /// Check if there are more bits to read
    pub fn has_more(&self) -> bool {
        self.byte_position < self.data.len()
    }

    /// Get the current position in bits
    pub fn position(&self) -> usize {
        self.byte_position * 8 + self.bit_position as usize
    }

    /// The underlying bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}
