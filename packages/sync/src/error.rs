//! Error types for planning and running a sync.

use std::path::PathBuf;

use supersync_gateway::GatewayError;
use supersync_index::IndexError;
use supersync_sync_models::{InvalidDestinationError, SyncPhase};

/// Problems detected before any network call is made.
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    /// The local file has no bytes; S3 multipart uploads need at least one
    /// part.
    #[error("{} is empty, nothing to upload", .path.display())]
    EmptyFile {
        /// Local path.
        path: PathBuf,
    },

    /// The local file could not be opened or inspected.
    #[error("Cannot read {}: {source}", .path.display())]
    Unreadable {
        /// Local path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The local path is not a regular file.
    #[error("{} is not a regular file", .path.display())]
    NotAFile {
        /// Local path.
        path: PathBuf,
    },

    /// The destination could not be split into bucket and key.
    #[error(transparent)]
    InvalidDestination(#[from] InvalidDestinationError),

    /// Concurrency was set to zero.
    #[error("Concurrency must be at least 1")]
    ZeroConcurrency,
}

/// Errors raised while syncing a file.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The sync could not be planned.
    #[error(transparent)]
    Planning(#[from] PlanningError),

    /// A storage request failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// A content index operation failed.
    #[error(transparent)]
    Index(#[from] IndexError),

    /// Reading a part's bytes from the local file failed.
    #[error("Failed to read bytes {range} of {}: {source}", .path.display())]
    Read {
        /// Local path.
        path: PathBuf,
        /// Byte range being read (`lower-upper`).
        range: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A worker failed while processing a part.
    #[error("Part {part_number} failed: {source}")]
    Part {
        /// 1-based part number.
        part_number: u32,
        /// What went wrong.
        source: Box<Self>,
    },

    /// A worker task panicked or was cancelled.
    #[error("Worker task failed: {message}")]
    Worker {
        /// Join error description.
        message: String,
    },

    /// Part results did not cover `1..=part_count` exactly once.
    #[error("Protocol violation: {message}")]
    Protocol {
        /// Description of the violation.
        message: String,
    },

    /// The sync failed after the multipart upload was started.
    ///
    /// The upload is left in place; callers can abort it with
    /// `upload_id`.
    #[error("Sync failed during {phase} (multipart upload {upload_id}): {source}")]
    Aborted {
        /// Multipart upload id left behind.
        upload_id: String,
        /// Phase the failure happened in.
        phase: SyncPhase,
        /// What went wrong.
        source: Box<Self>,
    },
}

impl SyncError {
    /// Upload id left behind by a failed sync, if one was started.
    #[must_use]
    pub fn upload_id(&self) -> Option<&str> {
        match self {
            Self::Aborted { upload_id, .. } => Some(upload_id),
            _ => None,
        }
    }

    /// Phase a failed sync stopped in, if the multipart upload was started.
    #[must_use]
    pub const fn phase(&self) -> Option<SyncPhase> {
        match self {
            Self::Aborted { phase, .. } => Some(*phase),
            _ => None,
        }
    }

    pub(crate) fn in_part(self, part_number: u32) -> Self {
        Self::Part {
            part_number,
            source: Box::new(self),
        }
    }

    pub(crate) fn aborted(self, upload_id: &str, phase: SyncPhase) -> Self {
        Self::Aborted {
            upload_id: upload_id.to_string(),
            phase,
            source: Box::new(self),
        }
    }
}
