//! Core types for Quiver

use crate::{QuiverError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Separator between tags inside a series key
pub const TAG_SEPARATOR: char = '^';

/// Separator between a tag key and its value
pub const TAG_KV_SEPARATOR: char = '=';

/// A single (key, value) tag. Ordering is by key, then value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

impl Tag {
    /// Create a new tag
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Reject tags that cannot be represented in a series key or the reverse log
    pub fn validate(&self) -> Result<()> {
        for part in [&self.key, &self.value] {
            if part.is_empty()
                || part.contains(TAG_SEPARATOR)
                || part.contains(TAG_KV_SEPARATOR)
                || part.chars().any(char::is_whitespace)
            {
                return Err(QuiverError::InvalidTag(self.to_string()));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.key, TAG_KV_SEPARATOR, self.value)
    }
}

/// Identity of a series: its sorted tag set encoded as `k1=v1^k2=v2`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SeriesKey(String);

impl SeriesKey {
    /// Build a key from tags that are already sorted
    pub fn from_sorted_tags(tags: &[Tag]) -> Self {
        let mut s = String::with_capacity(tags.len() * 8);
        for (i, tag) in tags.iter().enumerate() {
            if i > 0 {
                s.push(TAG_SEPARATOR);
            }
            s.push_str(&tag.key);
            s.push(TAG_KV_SEPARATOR);
            s.push_str(&tag.value);
        }
        Self(s)
    }

    /// Sort the tags, then build the key
    pub fn from_tags(tags: &mut [Tag]) -> Self {
        tags.sort();
        Self::from_sorted_tags(tags)
    }

    /// Split the key back into its tags
    pub fn decode_tags(&self) -> Result<Vec<Tag>> {
        if self.0.is_empty() {
            return Ok(Vec::new());
        }
        self.0
            .split(TAG_SEPARATOR)
            .map(|pair| {
                let mut parts = pair.split(TAG_KV_SEPARATOR);
                match (parts.next(), parts.next(), parts.next()) {
                    (Some(k), Some(v), None) => Ok(Tag::new(k, v)),
                    _ => Err(QuiverError::InvalidTag(format!(
                        "malformed series key segment '{}'",
                        pair
                    ))),
                }
            })
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the size in bytes
    pub fn size(&self) -> usize {
        self.0.len()
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Possible field value types
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// 64-bit float
    Float(f64),
    /// 64-bit signed integer
    Integer(i64),
}

impl FieldValue {
    /// Whether this value selects floating-point encoding for a new field
    pub fn is_fp(&self) -> bool {
        matches!(self, FieldValue::Float(_))
    }

    /// Get as f64
    pub fn as_f64(&self) -> f64 {
        match self {
            FieldValue::Float(v) => *v,
            FieldValue::Integer(v) => *v as f64,
        }
    }

    /// Get as i64
    pub fn as_i64(&self) -> i64 {
        match self {
            FieldValue::Integer(v) => *v,
            FieldValue::Float(v) => *v as i64,
        }
    }

    /// Raw 64-bit pattern stored by the value codecs for a field of the given kind
    pub fn to_bits(&self, fp: bool) -> u64 {
        if fp {
            self.as_f64().to_bits()
        } else {
            self.as_i64() as u64
        }
    }

    /// Inverse of [`FieldValue::to_bits`]
    pub fn from_bits(bits: u64, fp: bool) -> Self {
        if fp {
            FieldValue::Float(f64::from_bits(bits))
        } else {
            FieldValue::Integer(bits as i64)
        }
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Float(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

/// A single decoded data point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    /// Timestamp in milliseconds
    pub timestamp: Timestamp,
    pub value: FieldValue,
}

impl DataPoint {
    pub fn new(timestamp: Timestamp, value: impl Into<FieldValue>) -> Self {
        Self {
            timestamp,
            value: value.into(),
        }
    }
}

/// A multi-field point for one series
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Point {
    pub tags: Vec<Tag>,
    pub timestamp: Timestamp,
    pub fields: BTreeMap<String, FieldValue>,
}

impl Point {
    /// Create a point without fields
    pub fn new(tags: Vec<Tag>, timestamp: Timestamp) -> Self {
        Self {
            tags,
            timestamp,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field value
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

/// Query output for one (series, field) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesOutput {
    pub measurement: String,
    pub field: String,
    pub tags: Vec<Tag>,
    /// Whether the field is floating-point encoded
    pub fp: bool,
    pub points: Vec<DataPoint>,
}

/// Database level metadata supplied by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbMetadata {
    /// How long buckets are kept before garbage collection
    pub retention_hours: u32,
}

impl Default for DbMetadata {
    fn default() -> Self {
        Self { retention_hours: 28 }
    }
}
