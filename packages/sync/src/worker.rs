//! Per-part dedup-or-upload step.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use supersync_fingerprint::fingerprint;
use supersync_gateway::{CopySource, PartTarget, StorageGateway};
use supersync_index::ContentIndex;
use supersync_index_models::{ByteRange, Location};
use supersync_sync_models::{PartResult, PartSource, UploadSession};

use crate::error::SyncError;

/// Processes individual parts of one multipart upload.
///
/// Cheap to share: every spawned task holds an `Arc` to the same worker.
pub struct PartWorker {
    session: Arc<UploadSession>,
    upload_id: String,
    gateway: Arc<dyn StorageGateway>,
    index: ContentIndex,
}

impl PartWorker {
    /// Creates a worker for the upload `upload_id` of `session`.
    #[must_use]
    pub fn new(
        session: Arc<UploadSession>,
        upload_id: impl Into<String>,
        gateway: Arc<dyn StorageGateway>,
        index: ContentIndex,
    ) -> Self {
        Self {
            session,
            upload_id: upload_id.into(),
            gateway,
            index,
        }
    }

    /// Reads, fingerprints, and either copies or uploads `part_number`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Part`] wrapping the read, index, or gateway
    /// failure. Nothing is retried.
    pub async fn process(&self, part_number: u32) -> Result<PartResult, SyncError> {
        self.process_inner(part_number)
            .await
            .map_err(|e| e.in_part(part_number))
    }

    async fn process_inner(&self, part_number: u32) -> Result<PartResult, SyncError> {
        let part = self
            .session
            .part_range(part_number)
            .ok_or_else(|| SyncError::Protocol {
                message: format!(
                    "part {part_number} is outside 1..={}",
                    self.session.part_count
                ),
            })?;

        let path = self.session.local.clone();
        let mode = self.session.hash_mode;
        let range = part.range;
        let (bytes, fp) = tokio::task::spawn_blocking(move || {
            let bytes = read_range(&path, range).map_err(|source| SyncError::Read {
                path,
                range: range.to_string(),
                source,
            })?;
            let fp = fingerprint(&bytes, mode);
            Ok::<_, SyncError>((bytes, fp))
        })
        .await
        .map_err(|e| SyncError::Worker {
            message: e.to_string(),
        })??;

        let target = PartTarget {
            bucket: self.session.destination.bucket.clone(),
            key: self.session.destination.key.clone(),
            upload_id: self.upload_id.clone(),
            part_number,
        };

        let known = self.index.lookup(&fp).await?.unwrap_or_default();

        if let Some(location) = select_copy_source(&known, part_number, part.len()) {
            log::debug!(
                "Part {part_number} ({}) matches s3://{}/{} part {}, copying",
                fp.short(),
                location.bucket,
                location.key,
                location.part
            );
            let etag = self
                .gateway
                .copy_part(&target, &CopySource::from(location))
                .await?;
            return Ok(PartResult {
                part_number,
                etag,
                fingerprint: fp,
                content_range: range,
                source: PartSource::Copied {
                    source: location.clone(),
                },
            });
        }

        if !known.is_empty() {
            log::debug!(
                "Part {part_number} ({}) is indexed but no location has a {}-byte range, uploading",
                fp.short(),
                part.len()
            );
        }

        let (first, second) = self.session.hash_mode.digest_names();
        log::debug!(
            "Part {part_number} ({first}/{second} {}) is new, uploading {} bytes",
            fp.short(),
            bytes.len()
        );
        let etag = self.gateway.upload_part(&target, bytes).await?;
        Ok(PartResult {
            part_number,
            etag,
            fingerprint: fp,
            content_range: range,
            source: PartSource::Uploaded,
        })
    }
}

/// Picks the location to copy `part_number` from.
///
/// Only locations whose stored range has exactly `part_len` bytes are
/// usable. With several candidates the first-discovered one is skipped and
/// the rest are rotated by part number, which spreads copies across
/// source objects.
#[must_use]
pub fn select_copy_source(
    locations: &[Location],
    part_number: u32,
    part_len: u64,
) -> Option<&Location> {
    let candidates: Vec<&Location> = locations
        .iter()
        .filter(|l| l.size() == part_len)
        .collect();

    match candidates.as_slice() {
        [] => None,
        [only] => Some(*only),
        [_, rest @ ..] => {
            let slot = (part_number.saturating_sub(1) as usize) % rest.len();
            Some(rest[slot])
        }
    }
}

/// Reads exactly the bytes of `range` with a fresh read-only handle.
fn read_range(path: &Path, range: ByteRange) -> std::io::Result<Vec<u8>> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(range.lower))?;

    let len = usize::try_from(range.len()).map_err(std::io::Error::other)?;
    let mut buffer = vec![0u8; len];
    file.read_exact(&mut buffer)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn location(part: u32, range: ByteRange) -> Location {
        Location {
            bucket: "backups".to_string(),
            key: format!("copy-{part}"),
            version: "v1".to_string(),
            part,
            upload_id: "u".to_string(),
            content_range: range,
        }
    }

    #[test]
    fn single_matching_location_is_used() {
        let locations = vec![location(1, ByteRange::new(0, 99))];
        let chosen = select_copy_source(&locations, 7, 100).unwrap();
        assert_eq!(chosen.key, "copy-1");
    }

    #[test]
    fn length_mismatch_means_no_copy() {
        let locations = vec![location(1, ByteRange::new(0, 99))];
        assert!(select_copy_source(&locations, 1, 50).is_none());
        assert!(select_copy_source(&[], 1, 50).is_none());
    }

    #[test]
    fn first_location_is_skipped_when_others_exist() {
        let locations: Vec<Location> = (1..=4)
            .map(|n| location(n, ByteRange::new(0, 99)))
            .collect();

        let picks: Vec<&str> = (1..=6)
            .map(|part| select_copy_source(&locations, part, 100).unwrap().key.as_str())
            .collect();
        assert_eq!(
            picks,
            vec!["copy-2", "copy-3", "copy-4", "copy-2", "copy-3", "copy-4"]
        );
    }

    #[test]
    fn mismatched_lengths_are_filtered_before_rotation() {
        let locations = vec![
            location(1, ByteRange::new(0, 99)),
            location(2, ByteRange::new(0, 49)),
            location(3, ByteRange::new(100, 199)),
        ];
        let chosen = select_copy_source(&locations, 1, 100).unwrap();
        assert_eq!(chosen.key, "copy-3");
    }

    #[test]
    fn read_range_reads_exact_bytes() {
        let path = std::env::temp_dir().join("supersync_worker_read_range");
        let data: Vec<u8> = (0..=255).collect();
        std::fs::write(&path, &data).unwrap();

        let bytes = read_range(&path, ByteRange::new(10, 19)).unwrap();
        assert_eq!(bytes, (10..=19).collect::<Vec<u8>>());

        let err = read_range(&path, ByteRange::new(250, 299)).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::UnexpectedEof);

        std::fs::remove_file(&path).ok();
    }
}
