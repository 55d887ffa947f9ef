#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Content-addressed chunk index.
//!
//! Maps a chunk [`Fingerprint`] to every [`Location`] the chunk has been
//! written to. Entries are append-only: locations are never removed, and
//! concurrent appends to the same fingerprint are serialized with a
//! conditional write on the entry's revision so none are lost.
//!
//! The index also owns throughput scaling for large bursts of writes
//! ([`ContentIndex::ensure_capacity`]).

mod dynamo;
mod memory;
mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use supersync_fingerprint::Fingerprint;
use supersync_index_models::{Capacity, Location};
use supersync_sync_models::{DEFAULT_CONCURRENCY, PartResult};

pub use dynamo::{DynamoStore, HASH_KEY, RANGE_KEY};
pub use memory::MemoryStore;
pub use store::{KeyedStore, PutOutcome, StoreError};

/// Attempts made by [`ContentIndex::append_locations`] before giving up.
pub const MAX_APPEND_ATTEMPTS: u32 = 16;

/// Bursts smaller than this many writes never trigger a capacity change.
pub const MIN_PARTS_FOR_SCALING: u64 = 100;

/// Upper bound for provisioned read or write units.
pub const MAX_PROVISIONED_UNITS: u64 = 40_000;

const APPEND_BACKOFF: Duration = Duration::from_millis(5);

/// Errors raised by [`ContentIndex`].
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Reading an entry failed.
    #[error("Index lookup for {fingerprint} failed: {source}")]
    Lookup {
        /// Short form of the fingerprint.
        fingerprint: String,
        /// Underlying store error.
        source: StoreError,
    },

    /// Writing an entry failed.
    #[error("Index append for {fingerprint} failed: {source}")]
    Append {
        /// Short form of the fingerprint.
        fingerprint: String,
        /// Underlying store error.
        source: StoreError,
    },

    /// Every conditional write attempt lost to a concurrent writer.
    #[error("Index append for {fingerprint} gave up after {attempts} conflicting attempts")]
    Contention {
        /// Short form of the fingerprint.
        fingerprint: String,
        /// Attempts made.
        attempts: u32,
    },

    /// Reading or changing provisioned throughput failed.
    #[error("Index capacity {operation} failed: {source}")]
    Capacity {
        /// `describe` or `update`.
        operation: &'static str,
        /// Underlying store error.
        source: StoreError,
    },
}

/// Capacity state captured by [`ContentIndex::ensure_capacity`].
///
/// Hand it back to [`ContentIndex::restore_capacity`] once the burst is
/// over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[must_use]
pub struct CapacityLease {
    /// Capacity before it was raised, or `None` if it was left alone.
    pub raised_from: Option<Capacity>,
}

/// Fingerprint to locations index over a [`KeyedStore`].
#[derive(Clone)]
pub struct ContentIndex {
    store: Arc<dyn KeyedStore>,
    concurrency: usize,
}

impl ContentIndex {
    /// Creates an index over `store` with the default fan-out.
    #[must_use]
    pub fn new(store: Arc<dyn KeyedStore>) -> Self {
        Self {
            store,
            concurrency: DEFAULT_CONCURRENCY,
        }
    }

    /// Sets how many appends [`Self::push_locations`] runs at once.
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Returns every known location of `fingerprint`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Lookup`] if the store read fails. Lookups do
    /// not fall back to "not found" on errors.
    pub async fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<Location>>, IndexError> {
        let entry = self
            .store
            .get_item(fingerprint)
            .await
            .map_err(|source| IndexError::Lookup {
                fingerprint: fingerprint.short(),
                source,
            })?;

        Ok(entry
            .map(|e| e.locations)
            .filter(|locations| !locations.is_empty()))
    }

    /// Appends `location` to the entry for `fingerprint`, creating the entry
    /// if needed.
    ///
    /// # Errors
    ///
    /// See [`Self::append_locations`].
    pub async fn append_location(
        &self,
        fingerprint: &Fingerprint,
        location: &Location,
    ) -> Result<(), IndexError> {
        self.append_locations(fingerprint, std::slice::from_ref(location))
            .await
    }

    /// Appends every location in `locations`, in order, to the entry for
    /// `fingerprint` with a single conditional write.
    ///
    /// The read-modify-write is retried whenever another writer updated
    /// the entry in between. Retries back off linearly with random jitter
    /// so writers that keep colliding spread out.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Append`] if the store fails, or
    /// [`IndexError::Contention`] after [`MAX_APPEND_ATTEMPTS`] conflicts.
    pub async fn append_locations(
        &self,
        fingerprint: &Fingerprint,
        locations: &[Location],
    ) -> Result<(), IndexError> {
        if locations.is_empty() {
            return Ok(());
        }

        let append_error = |source| IndexError::Append {
            fingerprint: fingerprint.short(),
            source,
        };

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let current = self
                .store
                .get_item(fingerprint)
                .await
                .map_err(append_error)?;

            let expected = current.as_ref().map(|e| e.revision);
            let mut entry = current.unwrap_or_default();
            entry.locations.extend_from_slice(locations);
            entry.revision = expected.map_or(1, |r| r + 1);

            match self
                .store
                .put_item(fingerprint, &entry, expected)
                .await
                .map_err(append_error)?
            {
                PutOutcome::Written => {
                    log::trace!(
                        "Appended {} location(s) to {} (revision {}, {} total)",
                        locations.len(),
                        fingerprint.short(),
                        entry.revision,
                        entry.locations.len()
                    );
                    return Ok(());
                }
                PutOutcome::Conflict => {
                    log::debug!(
                        "Conflicting write on {} (attempt {attempt}/{MAX_APPEND_ATTEMPTS}), retrying",
                        fingerprint.short()
                    );
                    tokio::time::sleep(append_backoff(attempt)).await;
                }
            }
        }

        Err(IndexError::Contention {
            fingerprint: fingerprint.short(),
            attempts: MAX_APPEND_ATTEMPTS,
        })
    }

    /// Raises provisioned throughput ahead of `expected_write_count`
    /// writes.
    ///
    /// Nothing changes for small bursts, for on-demand stores, or when the
    /// current capacity already covers the burst. A store that refuses the
    /// change because it is busy only produces a warning.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Capacity`] if the store cannot be described or
    /// the update fails for a reason other than contention.
    pub async fn ensure_capacity(
        &self,
        expected_write_count: u64,
    ) -> Result<CapacityLease, IndexError> {
        if expected_write_count < MIN_PARTS_FOR_SCALING {
            return Ok(CapacityLease::default());
        }

        let current = self
            .store
            .describe_capacity()
            .await
            .map_err(|source| IndexError::Capacity {
                operation: "describe",
                source,
            })?;

        if current.is_on_demand() {
            log::debug!("Index {} is on-demand, not scaling", self.store.name());
            return Ok(CapacityLease::default());
        }

        let target_units = expected_write_count.min(MAX_PROVISIONED_UNITS);
        let target = Capacity::new(
            current.read_units.max(target_units),
            current.write_units.max(target_units),
        );

        if target == current {
            return Ok(CapacityLease::default());
        }

        log::info!(
            "Raising index {} capacity from {current} to {target} for {expected_write_count} parts",
            self.store.name()
        );

        if self.apply_capacity(target).await? {
            Ok(CapacityLease {
                raised_from: Some(current),
            })
        } else {
            Ok(CapacityLease::default())
        }
    }

    /// Lowers capacity back to where it was before
    /// [`Self::ensure_capacity`] raised it.
    ///
    /// # Errors
    ///
    /// Returns [`IndexError::Capacity`] if the update fails for a reason
    /// other than contention.
    pub async fn restore_capacity(&self, lease: CapacityLease) -> Result<(), IndexError> {
        let Some(previous) = lease.raised_from else {
            return Ok(());
        };

        log::info!(
            "Restoring index {} capacity to {previous}",
            self.store.name()
        );
        self.apply_capacity(previous).await.map(|_| ())
    }

    /// Returns whether the change was applied.
    async fn apply_capacity(&self, capacity: Capacity) -> Result<bool, IndexError> {
        match self.store.update_capacity(capacity).await {
            Ok(()) => Ok(true),
            Err(StoreError::CapacityBusy { table, message }) => {
                log::warn!(
                    "Capacity change on {table} skipped, another change is in progress: {message}"
                );
                Ok(false)
            }
            Err(source) => Err(IndexError::Capacity {
                operation: "update",
                source,
            }),
        }
    }

    /// Records where each part of a completed upload now lives.
    ///
    /// Parts are grouped by fingerprint first, so repeated content (zeroed
    /// blocks in a disk image, say) costs one conditional write per
    /// distinct chunk instead of a pile of writers racing on one entry.
    /// Locations within a group keep the order of `parts`.
    ///
    /// # Errors
    ///
    /// Returns the first [`IndexError`] encountered. Appends already in
    /// flight are allowed to finish.
    pub async fn push_locations(
        &self,
        parts: &[PartResult],
        bucket: &str,
        key: &str,
        version: &str,
        upload_id: &str,
    ) -> Result<(), IndexError> {
        let mut groups: Vec<(&Fingerprint, Vec<Location>)> = Vec::new();
        let mut slots: HashMap<&Fingerprint, usize> = HashMap::new();

        for part in parts {
            let location = Location {
                bucket: bucket.to_string(),
                key: key.to_string(),
                version: version.to_string(),
                part: part.part_number,
                upload_id: upload_id.to_string(),
                content_range: part.content_range,
            };
            let slot = *slots.entry(&part.fingerprint).or_insert_with(|| {
                groups.push((&part.fingerprint, Vec::new()));
                groups.len() - 1
            });
            groups[slot].1.push(location);
        }

        log::info!(
            "Recording {} part location(s) under {} fingerprint(s) for s3://{bucket}/{key} in index {}",
            parts.len(),
            groups.len(),
            self.store.name()
        );

        let appends: Vec<_> = groups
            .into_iter()
            .map(|(fingerprint, locations)| async move {
                self.append_locations(fingerprint, &locations).await
            })
            .collect();
        let results: Vec<Result<(), IndexError>> = futures::stream::iter(appends)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        results.into_iter().collect()
    }
}

impl std::fmt::Debug for ContentIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentIndex")
            .field("store", &self.store.name())
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

/// Linear backoff plus up to one extra step of random jitter.
fn append_backoff(attempt: u32) -> Duration {
    APPEND_BACKOFF * attempt + APPEND_BACKOFF.mul_f64(fastrand::f64() * f64::from(attempt))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use supersync_fingerprint::{HashMode, fingerprint};
    use supersync_index_models::{ByteRange, IndexEntry};
    use supersync_sync_models::PartSource;

    use super::*;

    const STORE_LATENCY: Duration = Duration::from_millis(3);

    /// [`MemoryStore`] with a round trip on every item request, so
    /// read-modify-write cycles of concurrent writers overlap.
    struct LaggingStore {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl KeyedStore for LaggingStore {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn get_item(
            &self,
            fingerprint: &Fingerprint,
        ) -> Result<Option<IndexEntry>, StoreError> {
            tokio::time::sleep(STORE_LATENCY).await;
            self.inner.get_item(fingerprint).await
        }

        async fn put_item(
            &self,
            fingerprint: &Fingerprint,
            entry: &IndexEntry,
            expected_revision: Option<u64>,
        ) -> Result<PutOutcome, StoreError> {
            tokio::time::sleep(STORE_LATENCY).await;
            self.inner.put_item(fingerprint, entry, expected_revision).await
        }

        async fn describe_capacity(&self) -> Result<Capacity, StoreError> {
            self.inner.describe_capacity().await
        }

        async fn update_capacity(&self, capacity: Capacity) -> Result<(), StoreError> {
            self.inner.update_capacity(capacity).await
        }
    }

    fn lagging(inner: &Arc<MemoryStore>) -> ContentIndex {
        ContentIndex::new(Arc::new(LaggingStore {
            inner: Arc::clone(inner),
        }))
    }

    fn part(part_number: u32, data: &[u8]) -> PartResult {
        let len = data.len() as u64;
        PartResult {
            part_number,
            etag: format!("\"etag-{part_number}\""),
            fingerprint: fingerprint(data, HashMode::Default),
            content_range: ByteRange::new(
                u64::from(part_number - 1) * len,
                u64::from(part_number) * len - 1,
            ),
            source: PartSource::Uploaded,
        }
    }

    fn location(part: u32) -> Location {
        Location {
            bucket: "backups".to_string(),
            key: "disk.img".to_string(),
            version: format!("v{part}"),
            part,
            upload_id: "upload-1".to_string(),
            content_range: ByteRange::new(0, 1023),
        }
    }

    fn index_with(store: Arc<MemoryStore>) -> ContentIndex {
        ContentIndex::new(store)
    }

    #[tokio::test]
    async fn unknown_fingerprint_is_not_found() {
        let index = index_with(Arc::new(MemoryStore::default()));
        let fp = fingerprint(b"never stored", HashMode::Default);
        assert_eq!(index.lookup(&fp).await.unwrap(), None);
    }

    #[tokio::test]
    async fn sequential_appends_are_returned_in_order() {
        let index = index_with(Arc::new(MemoryStore::default()));
        let fp = fingerprint(b"chunk", HashMode::Default);

        for part in 1..=5 {
            index.append_location(&fp, &location(part)).await.unwrap();
        }

        let found = index.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(found, (1..=5).map(location).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn duplicate_locations_are_kept() {
        let index = index_with(Arc::new(MemoryStore::default()));
        let fp = fingerprint(b"chunk", HashMode::Fast);

        index.append_location(&fp, &location(1)).await.unwrap();
        index.append_location(&fp, &location(1)).await.unwrap();

        assert_eq!(index.lookup(&fp).await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn revision_increases_with_every_append() {
        let store = Arc::new(MemoryStore::default());
        let index = index_with(store.clone());
        let fp = fingerprint(b"chunk", HashMode::Default);

        index.append_location(&fp, &location(1)).await.unwrap();
        index.append_location(&fp, &location(2)).await.unwrap();

        let entry = store.get_item(&fp).await.unwrap().unwrap();
        assert_eq!(entry.revision, 2);
    }

    #[tokio::test]
    async fn legacy_entries_without_revision_accept_appends() {
        let store = Arc::new(MemoryStore::default());
        let fp = fingerprint(b"legacy", HashMode::Default);
        let legacy = IndexEntry {
            locations: vec![location(9)],
            revision: 0,
        };
        assert_eq!(
            store.put_item(&fp, &legacy, None).await.unwrap(),
            PutOutcome::Written
        );

        let index = index_with(store);
        index.append_location(&fp, &location(1)).await.unwrap();

        let found = index.lookup(&fp).await.unwrap().unwrap();
        assert_eq!(found, vec![location(9), location(1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_appends_are_not_lost() {
        let store = Arc::new(MemoryStore::default());
        let index = lagging(&store);
        let fp = fingerprint(b"hot chunk", HashMode::Default);

        let mut handles = Vec::new();
        for part in 1..=8 {
            let index = index.clone();
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                index.append_location(&fp, &location(part)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(store.conflicts() > 0);

        let mut parts: Vec<u32> = index
            .lookup(&fp)
            .await
            .unwrap()
            .unwrap()
            .iter()
            .map(|l| l.part)
            .collect();
        parts.sort_unstable();
        assert_eq!(parts, (1..=8).collect::<Vec<_>>());
        assert_eq!(store.get_item(&fp).await.unwrap().unwrap().revision, 8);
    }

    #[tokio::test]
    async fn batched_append_is_a_single_write() {
        let store = Arc::new(MemoryStore::default());
        let index = index_with(store.clone());
        let fp = fingerprint(b"chunk", HashMode::Default);

        index.append_location(&fp, &location(1)).await.unwrap();
        index
            .append_locations(&fp, &[location(2), location(3)])
            .await
            .unwrap();
        index.append_locations(&fp, &[]).await.unwrap();

        let entry = store.get_item(&fp).await.unwrap().unwrap();
        assert_eq!(entry.revision, 2);
        assert_eq!(entry.locations, (1..=3).map(location).collect::<Vec<_>>());
    }

    #[test]
    fn backoff_grows_with_attempts() {
        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let delay = append_backoff(attempt);
            assert!(delay >= APPEND_BACKOFF * attempt);
            assert!(delay <= APPEND_BACKOFF * attempt * 2);
        }
    }

    #[tokio::test]
    async fn small_bursts_leave_capacity_alone() {
        let store = Arc::new(MemoryStore::new(Capacity::new(5, 5)));
        let index = index_with(store.clone());

        let lease = index.ensure_capacity(MIN_PARTS_FOR_SCALING - 1).await.unwrap();
        assert_eq!(lease.raised_from, None);
        assert!(store.capacity_history().is_empty());
    }

    #[tokio::test]
    async fn large_bursts_raise_and_restore_capacity() {
        let store = Arc::new(MemoryStore::new(Capacity::new(5, 5)));
        let index = index_with(store.clone());

        let lease = index.ensure_capacity(400).await.unwrap();
        assert_eq!(lease.raised_from, Some(Capacity::new(5, 5)));
        assert_eq!(store.describe_capacity().await.unwrap(), Capacity::new(400, 400));

        index.restore_capacity(lease).await.unwrap();
        assert_eq!(
            store.capacity_history(),
            vec![Capacity::new(400, 400), Capacity::new(5, 5)]
        );
    }

    #[tokio::test]
    async fn raised_capacity_is_capped() {
        let store = Arc::new(MemoryStore::new(Capacity::new(5, 5)));
        let index = index_with(store.clone());

        index.ensure_capacity(1_000_000).await.unwrap();
        assert_eq!(
            store.describe_capacity().await.unwrap(),
            Capacity::new(MAX_PROVISIONED_UNITS, MAX_PROVISIONED_UNITS)
        );
    }

    #[tokio::test]
    async fn sufficient_capacity_is_not_changed() {
        let store = Arc::new(MemoryStore::new(Capacity::new(1_000, 1_000)));
        let index = index_with(store.clone());

        let lease = index.ensure_capacity(500).await.unwrap();
        assert_eq!(lease.raised_from, None);
        assert!(store.capacity_history().is_empty());
    }

    #[tokio::test]
    async fn on_demand_store_is_not_scaled() {
        let store = Arc::new(MemoryStore::new(Capacity::new(0, 0)));
        let index = index_with(store.clone());

        let lease = index.ensure_capacity(5_000).await.unwrap();
        assert_eq!(lease.raised_from, None);
        assert!(store.capacity_history().is_empty());
    }

    #[tokio::test]
    async fn busy_store_is_a_warning_not_an_error() {
        let store = Arc::new(MemoryStore::new(Capacity::new(5, 5)).rejecting_capacity_updates());
        let index = index_with(store.clone());

        let lease = index.ensure_capacity(1_000).await.unwrap();
        assert_eq!(lease.raised_from, None);
        assert_eq!(store.describe_capacity().await.unwrap(), Capacity::new(5, 5));
    }

    #[tokio::test]
    async fn push_locations_records_every_part() {
        let store = Arc::new(MemoryStore::default());
        let index = index_with(store.clone()).with_concurrency(3);

        let parts: Vec<PartResult> = (1..=6u32)
            .map(|n| part(n, &[u8::try_from(n).unwrap(); 16]))
            .collect();

        index
            .push_locations(&parts, "backups", "disk.img", "v1", "upload-7")
            .await
            .unwrap();

        assert_eq!(store.len(), 6);
        for part in &parts {
            let found = index.lookup(&part.fingerprint).await.unwrap().unwrap();
            assert_eq!(found.len(), 1);
            assert_eq!(found[0].part, part.part_number);
            assert_eq!(found[0].content_range, part.content_range);
            assert_eq!(found[0].version, "v1");
            assert_eq!(found[0].upload_id, "upload-7");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn repeated_chunks_are_recorded_without_contention() {
        let store = Arc::new(MemoryStore::default());
        let index = lagging(&store).with_concurrency(10);

        let zeros = vec![0u8; 64];
        let mut parts: Vec<PartResult> = (1..=200u32).map(|n| part(n, &zeros)).collect();
        parts.push(part(201, &[7u8; 64]));

        index
            .push_locations(&parts, "backups", "disk.img", "v1", "upload-1")
            .await
            .unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.conflicts(), 0);

        let entry = store.get_item(&parts[0].fingerprint).await.unwrap().unwrap();
        assert_eq!(entry.revision, 1);
        assert_eq!(
            entry.locations.iter().map(|l| l.part).collect::<Vec<_>>(),
            (1..=200).collect::<Vec<_>>()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pushes_of_repeated_chunks_all_land() {
        let store = Arc::new(MemoryStore::default());
        let index = lagging(&store).with_concurrency(10);
        let zeros = vec![0u8; 64];

        let mut handles = Vec::new();
        for upload in 1..=4 {
            let index = index.clone();
            let parts: Vec<PartResult> = (1..=50u32).map(|n| part(n, &zeros)).collect();
            handles.push(tokio::spawn(async move {
                index
                    .push_locations(&parts, "backups", &format!("disk-{upload}.img"), "v1", "upload")
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let fp = fingerprint(&zeros, HashMode::Default);
        assert_eq!(index.lookup(&fp).await.unwrap().unwrap().len(), 200);
    }
}
