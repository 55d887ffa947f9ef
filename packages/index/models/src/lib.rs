#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Content index entry, location, and capacity types.
//!
//! These types describe what the content index stores: for every chunk
//! fingerprint, the ordered list of places the chunk has been written to.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// An inclusive byte range within an object, rendered as `"lower-upper"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteRange {
    /// First byte offset (inclusive).
    pub lower: u64,
    /// Last byte offset (inclusive).
    pub upper: u64,
}

impl ByteRange {
    /// Creates a range covering `lower..=upper`.
    #[must_use]
    pub const fn new(lower: u64, upper: u64) -> Self {
        Self { lower, upper }
    }

    /// Number of bytes covered by the range.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.upper - self.lower + 1
    }

    /// Always `false`; an inclusive range covers at least one byte.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Value for an HTTP `Range` / `x-amz-copy-source-range` header.
    #[must_use]
    pub fn header_value(&self) -> String {
        format!("bytes={self}")
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.lower, self.upper)
    }
}

/// Error returned when a stored range string is not `"lower-upper"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRangeError {
    /// The string that failed to parse.
    pub value: String,
}

impl std::fmt::Display for InvalidRangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid byte range {:?}: expected \"lower-upper\"", self.value)
    }
}

impl std::error::Error for InvalidRangeError {}

impl FromStr for ByteRange {
    type Err = InvalidRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidRangeError {
            value: s.to_string(),
        };
        let s_trimmed = s.strip_prefix("bytes=").unwrap_or(s);
        let (lower, upper) = s_trimmed.split_once('-').ok_or_else(err)?;
        let lower: u64 = lower.trim().parse().map_err(|_| err())?;
        let upper: u64 = upper.trim().parse().map_err(|_| err())?;
        if upper < lower {
            return Err(err());
        }
        Ok(Self { lower, upper })
    }
}

impl TryFrom<String> for ByteRange {
    type Error = InvalidRangeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ByteRange> for String {
    fn from(range: ByteRange) -> Self {
        range.to_string()
    }
}

/// Where a previously stored chunk physically lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Object version the chunk belongs to.
    pub version: String,
    /// Part number within that object's multipart upload.
    pub part: u32,
    /// Multipart upload that produced the object.
    pub upload_id: String,
    /// Byte range the chunk occupies in the object.
    pub content_range: ByteRange,
}

impl Location {
    /// Size of the chunk in bytes.
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.content_range.len()
    }
}

/// Value stored under one fingerprint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Locations in discovery order. Duplicates are allowed.
    pub locations: Vec<Location>,
    /// Incremented on every write; used for conditional updates.
    /// Entries written by older tools carry no revision and read as `0`.
    pub revision: u64,
}

/// Provisioned throughput of the keyed store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capacity {
    /// Provisioned read units.
    pub read_units: u64,
    /// Provisioned write units.
    pub write_units: u64,
}

impl Capacity {
    /// Creates a capacity value.
    #[must_use]
    pub const fn new(read_units: u64, write_units: u64) -> Self {
        Self {
            read_units,
            write_units,
        }
    }

    /// On-demand stores report no provisioned units and scale themselves.
    #[must_use]
    pub const fn is_on_demand(&self) -> bool {
        self.read_units == 0 && self.write_units == 0
    }
}

impl std::fmt::Display for Capacity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} RCU / {} WCU", self.read_units, self.write_units)
    }
}
