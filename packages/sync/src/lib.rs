#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Deduplicating multipart upload pipeline.
//!
//! A sync splits a local file into fixed-size parts. Each part is
//! fingerprinted and looked up in the content index: known content is
//! produced by a server-side copy from a location recorded earlier,
//! unknown content is uploaded. Once the multipart upload is complete
//! every part's new location is appended to the index, so the next sync
//! of the same (or similar) data can copy it.
//!
//! ```text
//! plan -> start upload -> dispatch parts -> collect -> sort -> complete -> index
//! ```
//!
//! [`UploadCoordinator`] drives the whole flow.

mod coordinator;
mod error;
pub mod planner;
pub mod progress;
pub mod scheduler;
pub mod worker;

#[cfg(test)]
mod testing;

pub use coordinator::UploadCoordinator;
pub use error::{PlanningError, SyncError};
pub use planner::{plan, prepare_session};
pub use progress::{NullProgress, ProgressCallback, null_progress};
pub use scheduler::PartScheduler;
pub use worker::PartWorker;
