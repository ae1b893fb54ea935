//! In-memory record store.

use std::collections::HashMap;
use std::sync::RwLock;

use tally_core::{InteractionRecord, RecordKey};

use super::{RecordStore, StoreError};

/// HashMap-backed store for tests and ephemeral servers.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<RecordKey, InteractionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store pre-populated with `records`.
    pub fn with_records(records: impl IntoIterator<Item = InteractionRecord>) -> Result<Self, StoreError> {
        let store = Self::new();
        for record in records {
            store.insert(record)?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(e: std::sync::PoisonError<T>) -> StoreError {
    StoreError::Lock(e.to_string())
}

impl RecordStore for MemoryStore {
    fn read(&self, key: &RecordKey) -> Result<InteractionRecord, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        records
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.clone()))
    }

    fn conditional_replace(
        &self,
        key: &RecordKey,
        record: &InteractionRecord,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let mut records = self.records.write().map_err(poisoned)?;
        let current = records
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if current.version != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual: current.version,
            });
        }

        let new_version = expected_version + 1;
        *current = record.clone();
        current.version = new_version;
        Ok(new_version)
    }

    fn insert(&self, record: InteractionRecord) -> Result<u64, StoreError> {
        let key = record.key();
        let mut records = self.records.write().map_err(poisoned)?;
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        let version = record.version;
        records.insert(key, record);
        Ok(version)
    }

    fn keys(&self) -> Result<Vec<RecordKey>, StoreError> {
        let records = self.records.read().map_err(poisoned)?;
        let mut keys: Vec<RecordKey> = records.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}
