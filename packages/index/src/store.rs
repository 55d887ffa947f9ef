//! Keyed store abstraction backing the content index.
//!
//! The index only needs four operations from its store: a consistent read
//! of one entry, a conditional write of one entry, and reading / changing
//! provisioned throughput. [`KeyedStore`] captures exactly that so the
//! index logic can run against `DynamoDB` in production and an in-process
//! map in tests.

use async_trait::async_trait;
use supersync_fingerprint::Fingerprint;
use supersync_index_models::{Capacity, IndexEntry};

/// Errors raised by a [`KeyedStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A request to the store failed.
    #[error("{operation} on table {table} failed: {source}")]
    Request {
        /// Store operation (e.g. `GetItem`).
        operation: &'static str,
        /// Table name.
        table: String,
        /// Underlying SDK error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A stored item could not be decoded.
    #[error("Malformed item in table {table}: {message}")]
    Malformed {
        /// Table name.
        table: String,
        /// What was wrong with the item.
        message: String,
    },

    /// The store refused a capacity change because another change is in
    /// flight or a rate limit was hit.
    #[error("Capacity change on table {table} rejected: {message}")]
    CapacityBusy {
        /// Table name.
        table: String,
        /// Reason reported by the store.
        message: String,
    },

    /// The table exists but its key schema cannot hold fingerprints.
    #[error("Table {table} has an incompatible key schema: {message}")]
    Schema {
        /// Table name.
        table: String,
        /// Description of the mismatch.
        message: String,
    },
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The entry was written.
    Written,
    /// The stored revision did not match the expected one; nothing was
    /// written.
    Conflict,
}

/// Minimal keyed store the content index is built on.
#[async_trait]
pub trait KeyedStore: Send + Sync {
    /// Human-readable store name for log lines (usually the table name).
    fn name(&self) -> &str;

    /// Reads the entry stored under `fingerprint`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached or the item is
    /// malformed.
    async fn get_item(&self, fingerprint: &Fingerprint) -> Result<Option<IndexEntry>, StoreError>;

    /// Writes `entry` under `fingerprint` if the stored revision still
    /// equals `expected_revision`.
    ///
    /// `None` means the entry must not exist yet. `Some(0)` also matches
    /// entries written without a revision.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached. A revision
    /// mismatch is not an error; it is reported as [`PutOutcome::Conflict`].
    async fn put_item(
        &self,
        fingerprint: &Fingerprint,
        entry: &IndexEntry,
        expected_revision: Option<u64>,
    ) -> Result<PutOutcome, StoreError>;

    /// Returns the currently provisioned throughput.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be reached.
    async fn describe_capacity(&self) -> Result<Capacity, StoreError>;

    /// Changes the provisioned throughput.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::CapacityBusy`] when the change is rejected
    /// because of a concurrent change or rate limit, and
    /// [`StoreError::Request`] for any other failure.
    async fn update_capacity(&self, capacity: Capacity) -> Result<(), StoreError>;
}
