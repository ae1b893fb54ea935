//! Record store adapter: read and conditional-replace of a single record.
//!
//! ```text
//! ┌───────────────┐  read / conditional_replace  ┌──────────────────┐
//! │ ToggleService │ ───────────────────────────► │ dyn RecordStore  │
//! └───────────────┘                              └────────┬─────────┘
//!                                                         │
//!                                        ┌────────────────┴───────────┐
//!                                        ▼                            ▼
//!                                 ┌─────────────┐            ┌─────────────────┐
//!                                 │ MemoryStore │            │ RocksRecordStore│
//!                                 │ (HashMap)   │            │ (LZ4 + bincode) │
//!                                 └─────────────┘            └─────────────────┘
//! ```
//!
//! There are no multi-record transactions. The store is the only shared
//! mutable resource of the subsystem; every write is a compare-and-swap on
//! the record's `version`.

pub mod ingest;
pub mod memory;
pub mod rocks;

use tally_core::{InteractionRecord, RecordKey, ToggleError};
use thiserror::Error;

pub use ingest::{ingest_documents, IngestReport};
pub use memory::MemoryStore;
pub use rocks::{RocksRecordStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record not found: {0}")]
    NotFound(RecordKey),
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: RecordKey,
        expected: u64,
        actual: u64,
    },
    #[error("record already exists: {0}")]
    AlreadyExists(RecordKey),
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("lock poisoned: {0}")]
    Lock(String),
}

impl From<StoreError> for ToggleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(key) => ToggleError::NotFound(key),
            other => ToggleError::Store(other.to_string()),
        }
    }
}

/// Read / conditional-write access to shared records keyed by (id, partition key).
pub trait RecordStore: Send + Sync {
    /// Fetch the current record, including its version.
    fn read(&self, key: &RecordKey) -> Result<InteractionRecord, StoreError>;

    /// Replace the record only if its stored version equals `expected_version`.
    ///
    /// On success the stored version is bumped and returned. The incoming
    /// record's own `version` field is ignored.
    fn conditional_replace(
        &self,
        key: &RecordKey,
        record: &InteractionRecord,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Create a record (ingestion path). Fails if the key is taken.
    fn insert(&self, record: InteractionRecord) -> Result<u64, StoreError>;

    /// Keys of all stored records.
    fn keys(&self) -> Result<Vec<RecordKey>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_maps_not_found_distinctly() {
        let key = RecordKey::new("r1", "p");
        assert_eq!(
            ToggleError::from(StoreError::NotFound(key.clone())),
            ToggleError::NotFound(key)
        );
        assert!(matches!(
            ToggleError::from(StoreError::Database("boom".into())),
            ToggleError::Store(_)
        ));
    }
}
