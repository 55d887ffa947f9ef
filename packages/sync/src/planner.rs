//! Chunk size and part count selection.
//!
//! Part size is sticky across syncs of the same key: when an object
//! already exists, its first part size is reused so unchanged chunks line
//! up with ranges already recorded in the index. The size only grows
//! (by doubling) when the file would otherwise need more than
//! [`MAX_PARTS`] parts.

use supersync_gateway::StorageGateway;
use supersync_sync_models::{ChunkPlan, SyncConfig, UploadSession};

use crate::error::{PlanningError, SyncError};

/// Chunk sizes are whole multiples of this.
pub const BASE_UNIT: u64 = 1024 * 1024;

/// Chunk size used when no prior object exists.
pub const DEFAULT_CHUNK_SIZE: u64 = 8 * BASE_UNIT;

/// Smallest part size S3 accepts for every part but the last.
pub const MIN_PART_SIZE: u64 = 5 * BASE_UNIT;

/// Maximum number of parts in one multipart upload.
pub const MAX_PARTS: u64 = 10_000;

/// Chooses the chunk size and part count for a file of `local_size`
/// bytes.
///
/// `prior_part_size` is the first part size of the object currently
/// stored at the destination, if any. It is only used when it is a
/// positive multiple of [`BASE_UNIT`] and at least [`MIN_PART_SIZE`].
#[must_use]
pub fn plan(local_size: u64, prior_part_size: Option<u64>) -> ChunkPlan {
    let mut chunk_size = match prior_part_size {
        Some(size) if is_valid_chunk_size(size) => size,
        Some(size) => {
            log::warn!(
                "Existing object has a first part of {size} bytes, which is not a usable \
                 chunk size; using {DEFAULT_CHUNK_SIZE}"
            );
            DEFAULT_CHUNK_SIZE
        }
        None => DEFAULT_CHUNK_SIZE,
    };

    while local_size.div_ceil(chunk_size) > MAX_PARTS {
        chunk_size *= 2;
    }

    #[allow(clippy::cast_possible_truncation)] // at most MAX_PARTS
    let part_count = local_size.div_ceil(chunk_size) as u32;

    ChunkPlan {
        chunk_size,
        part_count,
    }
}

const fn is_valid_chunk_size(size: u64) -> bool {
    size >= MIN_PART_SIZE && size % BASE_UNIT == 0
}

/// Checks `config` and the local file, asks the gateway for the prior
/// part size, and builds the session.
///
/// Local checks run before any network call.
///
/// # Errors
///
/// Returns [`SyncError::Planning`] for local problems and
/// [`SyncError::Gateway`] if the prior object cannot be inspected.
pub async fn prepare_session(
    config: &SyncConfig,
    gateway: &dyn StorageGateway,
) -> Result<UploadSession, SyncError> {
    if config.concurrency == 0 {
        return Err(PlanningError::ZeroConcurrency.into());
    }

    let local_size = local_file_size(config)?;

    let destination = &config.destination;
    let prior_part_size = gateway
        .head_first_part(&destination.bucket, &destination.key)
        .await?;

    match prior_part_size {
        Some(size) => log::info!("{destination} exists, first part is {size} bytes"),
        None => log::info!("{destination} does not exist yet"),
    }

    let ChunkPlan {
        chunk_size,
        part_count,
    } = plan(local_size, prior_part_size);

    log::info!(
        "Planned {} ({local_size} bytes) as {part_count} part(s) of {chunk_size} bytes",
        config.local.display()
    );

    Ok(UploadSession {
        local: config.local.clone(),
        destination: destination.clone(),
        local_size,
        chunk_size,
        part_count,
        hash_mode: config.hash_mode,
        concurrency: config.concurrency,
        upload_id: None,
    })
}

fn local_file_size(config: &SyncConfig) -> Result<u64, PlanningError> {
    let metadata = std::fs::metadata(&config.local).map_err(|source| PlanningError::Unreadable {
        path: config.local.clone(),
        source,
    })?;

    if !metadata.is_file() {
        return Err(PlanningError::NotAFile {
            path: config.local.clone(),
        });
    }

    if metadata.len() == 0 {
        return Err(PlanningError::EmptyFile {
            path: config.local.clone(),
        });
    }

    Ok(metadata.len())
}
