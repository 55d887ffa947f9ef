//! In-process [`KeyedStore`] used by tests and local dry runs.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use supersync_fingerprint::Fingerprint;
use supersync_index_models::{Capacity, IndexEntry};

use crate::store::{KeyedStore, PutOutcome, StoreError};

/// A [`KeyedStore`] held entirely in memory.
///
/// Requests complete without yielding, so writers only collide when the
/// caller awaits something between its read and its conditional write.
pub struct MemoryStore {
    name: String,
    entries: Mutex<HashMap<Fingerprint, IndexEntry>>,
    capacity: Mutex<Capacity>,
    capacity_history: Mutex<Vec<Capacity>>,
    reject_capacity_updates: bool,
    conflicts: Mutex<u64>,
}

impl MemoryStore {
    /// Creates an empty store reporting the given provisioned capacity.
    #[must_use]
    pub fn new(capacity: Capacity) -> Self {
        Self {
            name: "memory".to_string(),
            entries: Mutex::new(HashMap::new()),
            capacity: Mutex::new(capacity),
            capacity_history: Mutex::new(Vec::new()),
            reject_capacity_updates: false,
            conflicts: Mutex::new(0),
        }
    }

    /// Makes every capacity update fail with [`StoreError::CapacityBusy`],
    /// as if another session were changing the table at the same time.
    #[must_use]
    pub const fn rejecting_capacity_updates(mut self) -> Self {
        self.reject_capacity_updates = true;
        self
    }

    /// Number of entries stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every capacity successfully applied, in order.
    #[must_use]
    pub fn capacity_history(&self) -> Vec<Capacity> {
        self.capacity_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of conditional writes rejected so far.
    #[must_use]
    pub fn conflicts(&self) -> u64 {
        *self.conflicts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Capacity::new(5, 5))
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_item(&self, fingerprint: &Fingerprint) -> Result<Option<IndexEntry>, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned())
    }

    async fn put_item(
        &self,
        fingerprint: &Fingerprint,
        entry: &IndexEntry,
        expected_revision: Option<u64>,
    ) -> Result<PutOutcome, StoreError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let stored = entries.get(fingerprint).map(|e| e.revision);

        if stored != expected_revision {
            drop(entries);
            *self.conflicts.lock().unwrap_or_else(PoisonError::into_inner) += 1;
            return Ok(PutOutcome::Conflict);
        }

        entries.insert(fingerprint.clone(), entry.clone());
        Ok(PutOutcome::Written)
    }

    async fn describe_capacity(&self) -> Result<Capacity, StoreError> {
        Ok(*self.capacity.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn update_capacity(&self, capacity: Capacity) -> Result<(), StoreError> {
        if self.reject_capacity_updates {
            return Err(StoreError::CapacityBusy {
                table: self.name.clone(),
                message: "table is being updated".to_string(),
            });
        }

        *self.capacity.lock().unwrap_or_else(PoisonError::into_inner) = capacity;
        self.capacity_history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(capacity);
        Ok(())
    }
}
