//! Durable logs
//!
//! Two kinds of log back a measurement's metadata:
//!
//! - [`MappedLog`]: a memory-mapped, offset-limited record log used by the
//!   allocator's pointer log and the tag index's reverse log.
//! - The series log: an append-only file of checksummed [`SeriesEntry`] records,
//!   written before a new series becomes visible and replayed on open.

mod entry;
mod mapped;
mod reader;
mod writer;

pub use entry::SeriesEntry;
pub use mapped::{MappedLog, Records, HEADER_LEN, LEN_PREFIX};
pub use reader::SeriesLogReader;
pub use writer::SeriesLogWriter;
