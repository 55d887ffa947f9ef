#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Upload session, part, and sync report types.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use supersync_fingerprint::{Fingerprint, HashMode};
use supersync_index_models::{ByteRange, Location};

/// Default number of parts processed in parallel.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Default name of the content index table.
pub const DEFAULT_TABLE_NAME: &str = "supersync";

/// An upload target: bucket plus slash-delimited key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    /// Bucket name.
    pub bucket: String,
    /// Object key (may contain `/`).
    pub key: String,
}

/// Error returned when a destination cannot be split into bucket and key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidDestinationError {
    /// The destination as given.
    pub value: String,
}

impl std::fmt::Display for InvalidDestinationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid destination {:?}: expected s3://bucket/key",
            self.value
        )
    }
}

impl std::error::Error for InvalidDestinationError {}

impl FromStr for Destination {
    type Err = InvalidDestinationError;

    /// Parses `s3://bucket/path/to/key` or `bucket/path/to/key`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || InvalidDestinationError {
            value: s.to_string(),
        };
        let rest = s.strip_prefix("s3://").unwrap_or(s);
        let (bucket, key) = rest.split_once('/').ok_or_else(err)?;
        if bucket.is_empty() || key.is_empty() || key.ends_with('/') {
            return Err(err());
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

/// Everything a caller passes in to run one sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Local file to upload.
    pub local: PathBuf,
    /// Upload target.
    pub destination: Destination,
    /// Fingerprint mode for chunk deduplication.
    pub hash_mode: HashMode,
    /// Number of parts processed in parallel.
    pub concurrency: usize,
    /// Name of the content index table.
    pub table_name: String,
}

impl SyncConfig {
    /// Creates a config with default hash mode, concurrency, and table name.
    #[must_use]
    pub fn new(local: impl Into<PathBuf>, destination: Destination) -> Self {
        Self {
            local: local.into(),
            destination,
            hash_mode: HashMode::default(),
            concurrency: DEFAULT_CONCURRENCY,
            table_name: DEFAULT_TABLE_NAME.to_string(),
        }
    }
}

/// Chunk size and part count chosen for one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPlan {
    /// Size of every part except possibly the last.
    pub chunk_size: u64,
    /// `ceil(local_size / chunk_size)`.
    pub part_count: u32,
}

/// One part's byte range within the local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartRange {
    /// 1-based part number.
    pub part_number: u32,
    /// Bytes covered by the part.
    pub range: ByteRange,
}

impl PartRange {
    /// Number of bytes in the part.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.range.len()
    }

    /// Always `false`; parts cover at least one byte.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// State for one invocation of the uploader.
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// Local file being uploaded.
    pub local: PathBuf,
    /// Upload target.
    pub destination: Destination,
    /// Local file size in bytes.
    pub local_size: u64,
    /// Part size in bytes.
    pub chunk_size: u64,
    /// Number of parts.
    pub part_count: u32,
    /// Fingerprint mode.
    pub hash_mode: HashMode,
    /// Parallel worker count.
    pub concurrency: usize,
    /// Multipart upload id, assigned when the upload is started.
    pub upload_id: Option<String>,
}

impl UploadSession {
    /// Byte range of `part_number` (1-based).
    ///
    /// Returns `None` for part numbers outside `1..=part_count`.
    #[must_use]
    pub const fn part_range(&self, part_number: u32) -> Option<PartRange> {
        if part_number == 0 || part_number > self.part_count {
            return None;
        }
        let lower = (part_number as u64 - 1) * self.chunk_size;
        let upper = if part_number < self.part_count {
            part_number as u64 * self.chunk_size - 1
        } else {
            self.local_size - 1
        };
        Some(PartRange {
            part_number,
            range: ByteRange::new(lower, upper),
        })
    }

    /// All part ranges in ascending order.
    pub fn part_ranges(&self) -> impl Iterator<Item = PartRange> + '_ {
        (1..=self.part_count).filter_map(|n| self.part_range(n))
    }
}

/// How a part ended up in the multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartSource {
    /// Bytes were uploaded from the local file.
    Uploaded,
    /// Bytes were copied server-side from an indexed location.
    Copied {
        /// The location the part was copied from.
        source: Location,
    },
}

/// Output of processing one part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartResult {
    /// 1-based part number.
    pub part_number: u32,
    /// Tag returned by the backend for the part.
    pub etag: String,
    /// Fingerprint of the part's bytes.
    pub fingerprint: Fingerprint,
    /// Bytes the part covers in the local file.
    pub content_range: ByteRange,
    /// Whether the part was uploaded or copied.
    pub source: PartSource,
}

impl PartResult {
    /// Whether the part was satisfied by a server-side copy.
    #[must_use]
    pub const fn is_copy(&self) -> bool {
        matches!(self.source, PartSource::Copied { .. })
    }
}

/// Phase of a sync, in execution order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SyncPhase {
    /// Choosing chunk size and part count.
    Planning,
    /// Workers are copying or uploading parts.
    Uploading,
    /// Waiting for and validating part results.
    Collecting,
    /// Submitting the ordered part list.
    Completing,
    /// Recording part locations in the content index.
    Indexing,
    /// Finished.
    Done,
}

/// Summary of a finished sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    /// Local file that was uploaded.
    pub local: PathBuf,
    /// Upload target.
    pub destination: Destination,
    /// Multipart upload id.
    pub upload_id: String,
    /// Version id of the completed object.
    pub version: String,
    /// Part size in bytes.
    pub chunk_size: u64,
    /// Number of parts.
    pub part_count: u32,
    /// Parts sent from the local file.
    pub parts_uploaded: u32,
    /// Parts copied server-side.
    pub parts_copied: u32,
    /// Bytes sent from the local file.
    pub bytes_uploaded: u64,
    /// Bytes copied server-side.
    pub bytes_copied: u64,
    /// Wall-clock time of the sync.
    pub duration: Duration,
}

impl SyncReport {
    /// Fraction of bytes that did not need to be transferred (0.0 - 1.0).
    #[must_use]
    pub fn dedup_ratio(&self) -> f64 {
        let total = self.bytes_uploaded + self.bytes_copied;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)] // display-only ratio
        let ratio = self.bytes_copied as f64 / total as f64;
        ratio
    }
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        #[allow(clippy::cast_precision_loss)] // display-only MB values
        let (up_mb, copy_mb) = (
            self.bytes_uploaded as f64 / 1_048_576.0,
            self.bytes_copied as f64 / 1_048_576.0,
        );
        write!(
            f,
            "{} part(s) uploaded ({up_mb:.1} MB), {} part(s) copied ({copy_mb:.1} MB), \
             {:.0}% deduplicated in {:.1}s",
            self.parts_uploaded,
            self.parts_copied,
            self.dedup_ratio() * 100.0,
            self.duration.as_secs_f64()
        )
    }
}
