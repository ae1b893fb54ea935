//! Bulk loading of raw documents into a [`RecordStore`].
//!
//! Documents go through [`normalize_record`] first, so legacy shapes are
//! rewritten once here and never reach the toggle path.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tally_core::normalize_record;

use super::{RecordStore, StoreError};

/// Counts from one ingest run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub inserted: usize,
    /// Already present in the store.
    pub skipped: usize,
    /// Could not be normalized.
    pub invalid: usize,
}

/// Normalize and insert each document. Existing records are left untouched.
///
/// Only store failures other than a duplicate key abort the run.
pub fn ingest_documents(
    store: &dyn RecordStore,
    documents: &[Value],
    fallback: DateTime<Utc>,
) -> Result<IngestReport, StoreError> {
    let mut report = IngestReport::default();

    for doc in documents {
        let record = match normalize_record(doc, fallback) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Skipping document: {e}");
                report.invalid += 1;
                continue;
            }
        };
        match store.insert(record) {
            Ok(_) => report.inserted += 1,
            Err(StoreError::AlreadyExists(key)) => {
                log::debug!("Record {key} already stored");
                report.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }

    log::info!(
        "Ingested {} records ({} skipped, {} invalid)",
        report.inserted,
        report.skipped,
        report.invalid
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use tally_core::{InteractionField, RecordKey, UserId};

    #[test]
    fn test_ingest_normalizes_legacy_shapes() {
        let store = MemoryStore::new();
        let docs = vec![
            json!({
                "id": "opp-1",
                "partitionDate": "2025-01-15",
                "userSaves": ["alice"],
                "archivedBy": null,
                "pursued": true
            }),
            json!({ "id": "opp-2", "partitionKey": "2025-01-16", "seenBy": { "bob": "2025-01-16T08:00:00Z" } }),
            json!({ "partitionKey": "2025-01-16" }),
            json!("not a document"),
        ];

        let report = ingest_documents(&store, &docs, Utc::now()).unwrap();
        assert_eq!(report, IngestReport { inserted: 2, skipped: 0, invalid: 2 });

        let first = store.read(&RecordKey::new("opp-1", "2025-01-15")).unwrap();
        assert!(first.is_active(InteractionField::Saved, &UserId::new("alice")));
        assert!(first.archived_by.is_empty());
        assert!(first.pursued_by.is_empty());

        let second = store.read(&RecordKey::new("opp-2", "2025-01-16")).unwrap();
        assert!(second.is_active(InteractionField::Seen, &UserId::new("bob")));
    }

    #[test]
    fn test_ingest_skips_existing() {
        let store = MemoryStore::new();
        let docs = vec![json!({ "id": "opp-1", "partitionKey": "p" })];
        ingest_documents(&store, &docs, Utc::now()).unwrap();
        let report = ingest_documents(&store, &docs, Utc::now()).unwrap();
        assert_eq!(report.inserted, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(store.len(), 1);
    }
}
