//! Segment compression
//!
//! Timestamps use delta-of-delta encoding and values either the XOR scheme or
//! a ZigZag delta, following "Gorilla: A Fast, Scalable, In-Memory Time Series
//! Database". Segments are self-delimiting: the stream always ends in an
//! end-of-stream marker, and decoders report that marker (or a torn tail) as
//! `None` rather than an error.

mod bitstream;
mod reader;
mod timestamp;
mod value;
mod writer;

pub use bitstream::{BitReader, BitWriter};
pub use reader::{Reader, ReaderChain};
pub use timestamp::{
    decode_zigzag32, encode_zigzag32, TimestampCompressor, TimestampDecompressor,
    TimestampState, FIRST_DELTA_BITS, FIRST_DELTA_EOS, MAX_TIMESTAMP_BITS,
};
pub use value::{ValueCodec, ValueCompressor, ValueDecompressor, ValueState, MAX_VALUE_BITS};
pub use writer::Writer;

/// `[codec id][flags][0][0]`
pub const SEGMENT_HEADER_LEN: usize = 4;

/// Header flag: values are floating point
pub const FLAG_FP: u8 = 0b01;

/// Header flag: segment is sealed
pub const FLAG_READ_ONLY: u8 = 0b10;

/// Bytes one append can touch: a trailing partial byte, the point and an
/// end-of-stream marker
pub const MAX_POINT_BYTES: usize = (7 + MAX_TIMESTAMP_BITS + MAX_VALUE_BITS + MAX_TIMESTAMP_BITS + 7) / 8;
