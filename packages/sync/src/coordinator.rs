//! Drives one sync from planning to index update.

use std::sync::Arc;
use std::time::Instant;

use supersync_gateway::{CompletedPartTag, StorageGateway};
use supersync_index::ContentIndex;
use supersync_sync_models::{PartResult, SyncConfig, SyncPhase, SyncReport, UploadSession};

use crate::error::SyncError;
use crate::planner::prepare_session;
use crate::progress::{ProgressCallback, null_progress};
use crate::scheduler::{PartScheduler, order_results};
use crate::worker::PartWorker;

/// Runs syncs against one gateway and one index.
pub struct UploadCoordinator {
    gateway: Arc<dyn StorageGateway>,
    index: ContentIndex,
    progress: Arc<dyn ProgressCallback>,
}

impl UploadCoordinator {
    /// Creates a coordinator that reports no progress.
    #[must_use]
    pub fn new(gateway: Arc<dyn StorageGateway>, index: ContentIndex) -> Self {
        Self {
            gateway,
            index,
            progress: null_progress(),
        }
    }

    /// Reports per-part progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressCallback>) -> Self {
        self.progress = progress;
        self
    }

    /// Plans and runs a sync of `config.local` to `config.destination`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Planning`] before any request is made if the
    /// file or config is unusable. Once the multipart upload exists every
    /// failure is a [`SyncError::Aborted`] carrying its upload id.
    pub async fn sync(&self, config: &SyncConfig) -> Result<SyncReport, SyncError> {
        let session = prepare_session(config, self.gateway.as_ref()).await?;
        self.run(session).await
    }

    /// Runs a planned session.
    ///
    /// Index capacity is raised for large part counts and put back
    /// afterwards whether or not the sync succeeded.
    ///
    /// # Errors
    ///
    /// See [`Self::sync`].
    pub async fn run(&self, session: UploadSession) -> Result<SyncReport, SyncError> {
        let started = Instant::now();
        let lease = self
            .index
            .ensure_capacity(u64::from(session.part_count))
            .await?;

        let result = self.upload(session, started).await;

        if let Err(e) = self.index.restore_capacity(lease).await {
            log::warn!("Failed to restore index capacity: {e}");
        }

        result
    }

    async fn upload(
        &self,
        mut session: UploadSession,
        started: Instant,
    ) -> Result<SyncReport, SyncError> {
        let bucket = session.destination.bucket.clone();
        let key = session.destination.key.clone();
        let part_count = session.part_count;

        let upload_id = self.gateway.start_multipart_upload(&bucket, &key).await?;
        session.upload_id = Some(upload_id.clone());
        let session = Arc::new(session);
        let fail = |phase: SyncPhase| {
            let upload_id = upload_id.clone();
            move |e: SyncError| e.aborted(&upload_id, phase)
        };

        log::debug!("Upload {upload_id}: {}", SyncPhase::Uploading);
        self.progress.set_total(u64::from(part_count));
        self.progress.set_message(session.destination.to_string());

        let worker = Arc::new(PartWorker::new(
            Arc::clone(&session),
            upload_id.clone(),
            Arc::clone(&self.gateway),
            self.index.clone(),
        ));
        let mut scheduler = PartScheduler::new(session.concurrency);
        for part_number in 1..=part_count {
            scheduler.dispatch(&worker, part_number);
        }

        let results = scheduler
            .collect(self.progress.as_ref())
            .await
            .map_err(fail(SyncPhase::Uploading))?;

        log::debug!("Upload {upload_id}: {}", SyncPhase::Collecting);
        let results = order_results(results, part_count).map_err(fail(SyncPhase::Collecting))?;

        log::debug!("Upload {upload_id}: {}", SyncPhase::Completing);
        let tags: Vec<CompletedPartTag> = results
            .iter()
            .map(|r| CompletedPartTag {
                part_number: r.part_number,
                etag: r.etag.clone(),
            })
            .collect();
        let version = self
            .gateway
            .complete_multipart_upload(&bucket, &key, &upload_id, &tags)
            .await
            .map_err(|e| fail(SyncPhase::Completing)(e.into()))?;

        log::debug!("Upload {upload_id}: {}", SyncPhase::Indexing);
        self.index
            .clone()
            .with_concurrency(session.concurrency)
            .push_locations(&results, &bucket, &key, &version, &upload_id)
            .await
            .map_err(|e| fail(SyncPhase::Indexing)(e.into()))?;

        let report = build_report(&session, upload_id, version, &results, started);
        log::debug!("Upload {}: {}", report.upload_id, SyncPhase::Done);
        self.progress.finish(format!(
            "{} copied, {} uploaded",
            report.parts_copied, report.parts_uploaded
        ));
        log::info!("Synced {}: {report}", report.destination);

        Ok(report)
    }
}

fn build_report(
    session: &UploadSession,
    upload_id: String,
    version: String,
    results: &[PartResult],
    started: Instant,
) -> SyncReport {
    let mut report = SyncReport {
        local: session.local.clone(),
        destination: session.destination.clone(),
        upload_id,
        version,
        chunk_size: session.chunk_size,
        part_count: session.part_count,
        parts_uploaded: 0,
        parts_copied: 0,
        bytes_uploaded: 0,
        bytes_copied: 0,
        duration: started.elapsed(),
    };

    for result in results {
        let len = result.content_range.len();
        if result.is_copy() {
            report.parts_copied += 1;
            report.bytes_copied += len;
        } else {
            report.parts_uploaded += 1;
            report.bytes_uploaded += len;
        }
    }

    report
}
