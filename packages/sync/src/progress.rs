//! Part counter fed by the upload coordinator.
//!
//! A sync reports its part count once the upload has started, then one
//! tick per part as the collector receives it, copied and uploaded alike.
//! The CLI renders this as an `indicatif` bar; library callers that do not
//! care pass [`null_progress`].

use std::sync::Arc;

/// Sink for the coordinator's part counter.
///
/// Calls come from the collecting task, which may run on any runtime
/// thread.
pub trait ProgressCallback: Send + Sync {
    /// Part count of the upload that just started.
    fn set_total(&self, total: u64);

    /// `delta` more parts were received by the collector.
    fn inc(&self, delta: u64);

    /// Label for the running upload, normally its destination.
    fn set_message(&self, msg: String);

    /// The upload was completed and indexed; `msg` summarizes copied and
    /// uploaded parts.
    fn finish(&self, msg: String);

    /// The sync failed; drop the indicator so error output stays readable.
    fn finish_and_clear(&self);
}

/// Discards the part counter.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
    fn finish_and_clear(&self) {}
}

#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
