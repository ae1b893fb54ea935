//! One-time translation of historical document shapes into [`InteractionRecord`].
//!
//! Older documents stored interaction fields as arrays of user ids, booleans,
//! `null`, or under different names (`userSaves`, `archived`, `pursued`).
//! Everything is normalized here, at the storage boundary, so the rest of the
//! system only ever sees the canonical map shape.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::field::{InteractionField, UserId};
use crate::record::{InteractionMap, InteractionRecord};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LegacyError {
    #[error("document is not a JSON object")]
    NotAnObject,
    #[error("document has no string `id`")]
    MissingId,
    #[error("document {0} has no `partitionKey` or `partitionDate`")]
    MissingPartitionKey(String),
}

/// Field names that may hold each interaction map, canonical name first.
fn source_names(field: InteractionField) -> &'static [&'static str] {
    match field {
        InteractionField::Seen => &["seenBy"],
        InteractionField::Saved => &["savedBy", "userSaves"],
        InteractionField::Archived => &["archivedBy", "archived"],
        InteractionField::Pursued => &["pursuedBy", "pursued"],
    }
}

/// Normalize a single field value of any historical shape.
///
/// `fallback` is used where the old encoding carried no timestamp.
pub fn normalize_field(value: Option<&Value>, fallback: DateTime<Utc>) -> InteractionMap {
    match value {
        Some(Value::Object(entries)) => entries
            .iter()
            .filter(|(user, _)| !user.trim().is_empty())
            .map(|(user, at)| (UserId::new(user.as_str()), parse_timestamp(at).unwrap_or(fallback)))
            .collect(),
        Some(Value::Array(users)) => users
            .iter()
            .filter_map(Value::as_str)
            .filter(|user| !user.trim().is_empty())
            .map(|user| (UserId::new(user), fallback))
            .collect(),
        // null, booleans, numbers, strings and missing keys carry no per-user data
        _ => InteractionMap::new(),
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|at| at.with_timezone(&Utc))
}

fn lookup<'a>(doc: &'a Map<String, Value>, field: InteractionField) -> Option<&'a Value> {
    let names = source_names(field);
    // Prefer the first name that holds a usable map or list.
    names
        .iter()
        .filter_map(|name| doc.get(*name))
        .find(|v| v.is_object() || v.is_array())
        .or_else(|| names.iter().find_map(|name| doc.get(*name)))
}

/// Translate a stored document into the canonical record shape.
pub fn normalize_record(doc: &Value, fallback: DateTime<Utc>) -> Result<InteractionRecord, LegacyError> {
    let doc = doc.as_object().ok_or(LegacyError::NotAnObject)?;

    let id = doc
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(LegacyError::MissingId)?;

    let partition_key = ["partitionKey", "partitionDate"]
        .iter()
        .find_map(|name| doc.get(*name).and_then(Value::as_str).filter(|pk| !pk.is_empty()))
        .ok_or_else(|| LegacyError::MissingPartitionKey(id.to_string()))?;

    // Documents predating per-user tracking fall back to their ingestion time.
    let fallback = match doc.get("ingestedAt").and_then(parse_timestamp) {
        Some(at) => at,
        None => {
            log::trace!("Document {id} has no ingestedAt, using {fallback}");
            fallback
        }
    };

    let mut record = InteractionRecord::new(id, partition_key);
    record.version = doc.get("version").and_then(Value::as_u64).unwrap_or(0);
    for field in InteractionField::ALL {
        let value = lookup(doc, field);
        if let Some(scalar) = value.filter(|v| !v.is_object() && !v.is_array() && !v.is_null()) {
            log::debug!("Document {id}: dropping {field} value {scalar} with no per-user data");
        }
        *record.field_mut(field) = normalize_field(value, fallback);
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn fallback() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_canonical_maps_pass_through() {
        let doc = json!({
            "id": "opp-1",
            "partitionKey": "2025-01-15",
            "version": 7,
            "seenBy": { "alice": "2025-01-15T10:00:00Z" },
            "savedBy": { "alice": "2025-01-15T10:00:00Z" },
            "archivedBy": {},
            "pursuedBy": {}
        });
        let record = normalize_record(&doc, fallback()).unwrap();
        let alice = UserId::new("alice");
        assert_eq!(record.version, 7);
        assert!(record.is_active(InteractionField::Saved, &alice));
        assert_eq!(
            record.state(InteractionField::Seen, &alice).timestamp(),
            Some(Utc.with_ymd_and_hms(2025, 1, 15, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_legacy_names_and_shapes() {
        let doc = json!({
            "id": "opp-2",
            "partitionDate": "2025-01-16",
            "userSaves": ["alice", "bob", 3],
            "archived": true,
            "pursued": null,
            "seenBy": { "carol": 42 }
        });
        let record = normalize_record(&doc, fallback()).unwrap();
        assert_eq!(record.partition_key, "2025-01-16");
        assert_eq!(record.saved_by.len(), 2);
        assert_eq!(
            record.state(InteractionField::Saved, &UserId::new("bob")).timestamp(),
            Some(fallback())
        );
        assert!(record.archived_by.is_empty());
        assert!(record.pursued_by.is_empty());
        assert_eq!(
            record.state(InteractionField::Seen, &UserId::new("carol")).timestamp(),
            Some(fallback())
        );
    }

    #[test]
    fn test_ingested_at_overrides_fallback() {
        let doc = json!({
            "id": "opp-3",
            "partitionKey": "p",
            "ingestedAt": "2024-06-01T12:00:00Z",
            "archived": ["dave"]
        });
        let record = normalize_record(&doc, fallback()).unwrap();
        assert_eq!(
            record.state(InteractionField::Archived, &UserId::new("dave")).timestamp(),
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_canonical_name_wins_over_legacy() {
        let doc = json!({
            "id": "opp-4",
            "partitionKey": "p",
            "savedBy": { "erin": "2025-02-01T00:00:00Z" },
            "userSaves": ["frank"]
        });
        let record = normalize_record(&doc, fallback()).unwrap();
        assert!(record.is_active(InteractionField::Saved, &UserId::new("erin")));
        assert!(!record.is_active(InteractionField::Saved, &UserId::new("frank")));
    }

    #[test]
    fn test_empty_partition_key_falls_back_to_partition_date() {
        let doc = json!({
            "id": "opp-5",
            "partitionKey": "",
            "partitionDate": "2025-01-17"
        });
        let record = normalize_record(&doc, fallback()).unwrap();
        assert_eq!(record.partition_key, "2025-01-17");
    }

    #[test]
    fn test_rejects_malformed_documents() {
        assert_eq!(normalize_record(&json!([1, 2]), fallback()), Err(LegacyError::NotAnObject));
        assert_eq!(
            normalize_record(&json!({ "partitionKey": "p" }), fallback()),
            Err(LegacyError::MissingId)
        );
        assert_eq!(
            normalize_record(&json!({ "id": "x" }), fallback()),
            Err(LegacyError::MissingPartitionKey("x".into()))
        );
    }
}
