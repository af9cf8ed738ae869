//! Storage - measurements, series and their time-bucketed fields

mod field;
mod measurement;
mod predicate;
mod series;

pub use field::{FieldBucket, FieldReaderIterator};
pub use measurement::{Measurement, MeasurementStats};
pub use predicate::Predicate;
pub use series::Series;

use crate::compression::ValueCodec;
use crate::config;
use crate::malloc::MallocConfig;
use crate::{QuiverError, Result, Timestamp};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Measurement configuration, parsed from the engine's option map
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementConfig {
    /// Value codec for new segments
    pub codec: ValueCodec,
    /// Allocator limits
    pub malloc: MallocConfig,
    /// Size of a new segment's region
    pub buffer_size: usize,
    /// Fan queries out over rayon
    pub use_query_pool: bool,
    /// Run compaction and garbage collection in the background
    pub compaction_enabled: bool,
    /// Capacity of a compacted segment relative to the bytes it replaces
    pub compaction_ratio: f64,
    pub compaction_frequency: Duration,
    pub gc_frequency: Duration,
    /// Width of a time bucket in seconds
    pub bucket_size_secs: u32,
}

impl Default for MeasurementConfig {
    fn default() -> Self {
        Self {
            codec: ValueCodec::Gorilla,
            malloc: MallocConfig::default(),
            buffer_size: config::DEFAULT_BUFFER_SIZE,
            use_query_pool: true,
            compaction_enabled: true,
            compaction_ratio: config::DEFAULT_COMPACTION_RATIO,
            compaction_frequency: Duration::from_secs(config::DEFAULT_COMPACTION_FREQUENCY_SECS),
            gc_frequency: Duration::from_secs(config::DEFAULT_GC_FREQUENCY_SECS),
            bucket_size_secs: config::DEFAULT_BUCKET_SIZE_SECS,
        }
    }
}

fn parse_option<T: FromStr>(options: &HashMap<String, String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match options.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| {
            QuiverError::Config(format!("invalid value {:?} for {}: {}", raw, key, e))
        }),
    }
}

impl MeasurementConfig {
    /// Build and validate a configuration from string options
    pub fn from_options(
        options: &HashMap<String, String>,
        bucket_size_secs: u32,
    ) -> Result<Self> {
        let defaults = Self::default();

        let codec = match options.get("disk.compression.class") {
            Some(name) => ValueCodec::from_name(name.trim())?,
            None => defaults.codec,
        };

        let file_max: usize = parse_option(options, "malloc.file.max", defaults.malloc.file_max)?;
        let file_increment: usize = parse_option(
            options,
            "malloc.file.increment",
            defaults.malloc.file_increment.min(file_max),
        )?;
        let total_max: Option<u64> = match options.get("malloc.total.max") {
            None => None,
            Some(_) => Some(parse_option(options, "malloc.total.max", 0u64)?),
        };
        let ptrfile_increment: usize = parse_option(
            options,
            "malloc.ptrfile.increment",
            defaults.malloc.ptrfile_increment,
        )?;
        let buffer_size: usize = parse_option(options, "buffer.size", defaults.buffer_size)?;
        let compaction_frequency: u64 = parse_option(
            options,
            "compaction.frequency",
            defaults.compaction_frequency.as_secs(),
        )?;
        let gc_frequency: u64 =
            parse_option(options, "gc.frequency", defaults.gc_frequency.as_secs())?;

        let config = Self {
            codec,
            malloc: MallocConfig {
                file_max,
                file_increment,
                total_max,
                ptrfile_increment,
            },
            buffer_size,
            use_query_pool: parse_option(options, "use.query.pool", defaults.use_query_pool)?,
            compaction_enabled: parse_option(
                options,
                "compaction.enabled",
                defaults.compaction_enabled,
            )?,
            compaction_ratio: parse_option(
                options,
                "compaction.ratio",
                defaults.compaction_ratio,
            )?,
            compaction_frequency: Duration::from_secs(compaction_frequency),
            gc_frequency: Duration::from_secs(gc_frequency),
            bucket_size_secs,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check every limit
    pub fn validate(&self) -> Result<()> {
        let malloc = &self.malloc;
        if malloc.file_max < config::MIN_FILE_MAX {
            return Err(QuiverError::Config(format!(
                "malloc.file.max must be at least {} bytes, got {}",
                config::MIN_FILE_MAX,
                malloc.file_max
            )));
        }
        if malloc.file_max > u32::MAX as usize {
            return Err(QuiverError::Config(format!(
                "malloc.file.max must fit in 32 bits, got {}",
                malloc.file_max
            )));
        }
        if malloc.file_increment == 0 || malloc.file_increment > malloc.file_max {
            return Err(QuiverError::Config(format!(
                "malloc.file.increment must be in 1..={}, got {}",
                malloc.file_max, malloc.file_increment
            )));
        }
        if let Some(total) = malloc.total_max {
            if total < malloc.file_max as u64 {
                return Err(QuiverError::Config(format!(
                    "malloc.total.max ({}) is below malloc.file.max ({})",
                    total, malloc.file_max
                )));
            }
        }
        if malloc.ptrfile_increment < config::MIN_PTRFILE_INCREMENT {
            return Err(QuiverError::Config(format!(
                "malloc.ptrfile.increment must be at least {} bytes, got {}",
                config::MIN_PTRFILE_INCREMENT,
                malloc.ptrfile_increment
            )));
        }
        if self.buffer_size < config::MIN_BUFFER_SIZE || self.buffer_size > malloc.file_max {
            return Err(QuiverError::Config(format!(
                "buffer.size must be in {}..={}, got {}",
                config::MIN_BUFFER_SIZE,
                malloc.file_max,
                self.buffer_size
            )));
        }
        if self.compaction_ratio.is_nan() || self.compaction_ratio < 1.0 {
            return Err(QuiverError::Config(format!(
                "compaction.ratio must be at least 1.0, got {}",
                self.compaction_ratio
            )));
        }
        if self.compaction_frequency.is_zero() || self.gc_frequency.is_zero() {
            return Err(QuiverError::Config(
                "compaction.frequency and gc.frequency must be positive".into(),
            ));
        }
        validate_bucket_size(self.bucket_size_secs)
    }
}

/// Bucket offsets in milliseconds must fit the 27-bit first delta
pub fn validate_bucket_size(bucket_size_secs: u32) -> Result<()> {
    if bucket_size_secs == 0 || bucket_size_secs > config::MAX_BUCKET_SIZE_SECS {
        return Err(QuiverError::Config(format!(
            "time bucket size must be in 1..={} seconds, got {}",
            config::MAX_BUCKET_SIZE_SECS,
            bucket_size_secs
        )));
    }
    Ok(())
}

/// Time bucket of a millisecond timestamp
#[inline]
pub fn bucket_id(timestamp: Timestamp, bucket_size_secs: u32) -> i64 {
    timestamp
        .div_euclid(1000)
        .div_euclid(bucket_size_secs as i64)
}

/// First millisecond of a time bucket
#[inline]
pub fn bucket_start(bucket: i64, bucket_size_secs: u32) -> Timestamp {
    bucket * bucket_size_secs as i64 * 1000
}

/// Segment parameters shared by every field of a measurement
#[derive(Debug, Clone, Copy)]
pub(crate) struct SegmentConfig {
    pub codec: ValueCodec,
    pub buffer_size: usize,
    pub bucket_size_secs: u32,
}
