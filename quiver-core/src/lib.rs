//! Quiver Core - Tag-Indexed Time-Series Storage
//!
//! The storage core of a time-series database, organized per measurement:
//!
//! - **Compression**: Gorilla-style delta-of-delta timestamps and XOR or
//!   ZigZag-delta values, written bit by bit into segments
//! - **Malloc**: memory-mapped data files carved into fixed-size regions,
//!   tracked by a pointer log so segments survive a restart
//! - **Tag index**: tag key → tag value → roaring bitmap of series rows,
//!   rebuilt from a reverse log on open
//! - **Storage**: measurements own series, series own fields, fields own
//!   time buckets of segments
//! - **Compaction**: folds a bucket's segments into one and evicts buckets
//!   past retention, optionally on a background tokio task
//!
//! # Example
//!
//! ```no_run
//! use quiver_core::storage::{Measurement, MeasurementConfig};
//! use quiver_core::{DbMetadata, FieldValue, Tag};
//! use std::path::Path;
//!
//! # fn main() -> quiver_core::Result<()> {
//! let measurement = Measurement::open(
//!     MeasurementConfig::default(),
//!     "metrics",
//!     "cpu",
//!     Path::new("/tmp/quiver/index"),
//!     Path::new("/tmp/quiver/data"),
//!     DbMetadata::default(),
//!     None,
//! )?;
//! let tags = vec![Tag::new("host", "a")];
//! measurement.ingest("usage", &tags, 1_700_000_000_000, FieldValue::Float(0.5), false)?;
//! let output = measurement.query("usage", 0, i64::MAX, None, None)?;
//! assert_eq!(output[0].points.len(), 1);
//! measurement.close()?;
//! # Ok(())
//! # }
//! ```

pub mod compaction;
pub mod compression;
pub mod index;
pub mod malloc;
pub mod storage;
pub mod wal;

mod error;
mod types;

pub use error::{QuiverError, Result};
pub use types::*;

/// Quiver version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod config {
    /// Largest data file (64MB)
    pub const DEFAULT_FILE_MAX: usize = 64 * 1024 * 1024;

    /// Smallest accepted `malloc.file.max` (2MB)
    pub const MIN_FILE_MAX: usize = 2 * 1024 * 1024;

    /// Data file growth step (1MB)
    pub const DEFAULT_FILE_INCREMENT: usize = 1024 * 1024;

    /// Pointer log growth step (1MB)
    pub const DEFAULT_PTRFILE_INCREMENT: usize = 1024 * 1024;

    pub const MIN_PTRFILE_INCREMENT: usize = 1024;

    /// Region size of a new segment (16KB)
    pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

    pub const MIN_BUFFER_SIZE: usize = 64;

    pub const DEFAULT_COMPACTION_RATIO: f64 = 1.2;

    pub const DEFAULT_COMPACTION_FREQUENCY_SECS: u64 = 30 * 60;

    pub const DEFAULT_GC_FREQUENCY_SECS: u64 = 60 * 60;

    /// Default time bucket width in seconds
    pub const DEFAULT_BUCKET_SIZE_SECS: u32 = 4096;

    /// Widest time bucket whose millisecond offsets fit the 27-bit first delta
    pub const MAX_BUCKET_SIZE_SECS: u32 = 134_217;
}
