//! Transport-agnostic entry points with HTTP-shaped request and response bodies.
//!
//! ```text
//! toggle_seen(recordId, userId)      -> { success, seen }
//! toggle_saved(recordId, userId)     -> { success, saved }
//! toggle_archived(recordId, userId)  -> { success, archived }
//! toggle_pursued(recordId, userId)   -> { success, pursued }
//! ```
//!
//! A missing `userId` is a validation failure (400). Not-found (404),
//! exhausted conflicts (409) and store failures (500) are kept apart.

use std::sync::Arc;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tally_core::{InteractionField, RecordKey, ToggleError, UserId};

use crate::toggle::ToggleService;

/// Body of a toggle request. `partitionDate` is accepted for older callers.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default, alias = "partitionDate")]
    pub partition_key: Option<String>,
}

/// `{ "success": true, "<field>": bool }`, e.g. `{ "success": true, "archived": false }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToggleResponse {
    pub field: InteractionField,
    pub success: bool,
    pub active: bool,
}

impl Serialize for ToggleResponse {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("success", &self.success)?;
        map.serialize_entry(self.field.response_key(), &self.active)?;
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkPursueResponse {
    pub success: bool,
    pub updated_count: usize,
}

/// Failure body: `{ "success": false, "error": "...", "status": 404 }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
    pub status: u16,
}

impl From<&ToggleError> for ErrorResponse {
    fn from(e: &ToggleError) -> Self {
        Self {
            success: false,
            error: e.to_string(),
            status: e.status(),
        }
    }
}

/// The exposed interaction operations.
#[derive(Clone)]
pub struct InteractionApi {
    service: Arc<ToggleService>,
}

impl InteractionApi {
    pub fn new(service: Arc<ToggleService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<ToggleService> {
        &self.service
    }

    pub fn toggle_seen(&self, record_id: &str, req: &ToggleRequest) -> Result<ToggleResponse, ToggleError> {
        self.toggle(record_id, InteractionField::Seen, req)
    }

    pub fn toggle_saved(&self, record_id: &str, req: &ToggleRequest) -> Result<ToggleResponse, ToggleError> {
        self.toggle(record_id, InteractionField::Saved, req)
    }

    pub fn toggle_archived(&self, record_id: &str, req: &ToggleRequest) -> Result<ToggleResponse, ToggleError> {
        self.toggle(record_id, InteractionField::Archived, req)
    }

    pub fn toggle_pursued(&self, record_id: &str, req: &ToggleRequest) -> Result<ToggleResponse, ToggleError> {
        self.toggle(record_id, InteractionField::Pursued, req)
    }

    pub fn toggle(
        &self,
        record_id: &str,
        field: InteractionField,
        req: &ToggleRequest,
    ) -> Result<ToggleResponse, ToggleError> {
        let (key, user) = resolve(record_id, req)?;
        let outcome = self.service.toggle(&key, &user, field)?;
        Ok(ToggleResponse {
            field,
            success: true,
            active: outcome.active,
        })
    }

    pub fn mark_seen(&self, record_id: &str, req: &ToggleRequest) -> Result<ToggleResponse, ToggleError> {
        let (key, user) = resolve(record_id, req)?;
        let outcome = self.service.mark_seen(&key, &user)?;
        Ok(ToggleResponse {
            field: InteractionField::Seen,
            success: true,
            active: outcome.active,
        })
    }

    pub fn bulk_pursue(&self, user_id: Option<&str>, keys: &[RecordKey]) -> Result<BulkPursueResponse, ToggleError> {
        let user = required_user(user_id)?;
        let updated_count = self.service.bulk_pursue(&user, keys)?;
        Ok(BulkPursueResponse {
            success: true,
            updated_count,
        })
    }
}

fn required_user(user_id: Option<&str>) -> Result<UserId, ToggleError> {
    match user_id.map(str::trim) {
        Some(id) if !id.is_empty() => Ok(UserId::new(id)),
        _ => Err(ToggleError::Validation("userId is required".into())),
    }
}

fn resolve(record_id: &str, req: &ToggleRequest) -> Result<(RecordKey, UserId), ToggleError> {
    let user = required_user(req.user_id.as_deref())?;
    let partition_key = req
        .partition_key
        .as_deref()
        .filter(|pk| !pk.is_empty())
        .ok_or_else(|| ToggleError::Validation("partitionKey is required".into()))?;
    Ok((RecordKey::new(record_id, partition_key), user))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, RecordStore};
    use serde_json::json;
    use tally_core::InteractionRecord;

    fn api() -> (Arc<MemoryStore>, InteractionApi) {
        let store = Arc::new(MemoryStore::with_records([InteractionRecord::new("opp-1", "2025-01-15")]).unwrap());
        let service = Arc::new(ToggleService::new(store.clone()));
        (store, InteractionApi::new(service))
    }

    fn req(user: Option<&str>) -> ToggleRequest {
        ToggleRequest {
            user_id: user.map(String::from),
            partition_key: Some("2025-01-15".into()),
        }
    }

    #[test]
    fn test_response_body_uses_field_key() {
        let (_store, api) = api();
        let resp = api.toggle_archived("opp-1", &req(Some("alice"))).unwrap();
        assert_eq!(serde_json::to_value(resp).unwrap(), json!({ "success": true, "archived": true }));

        let resp = api.toggle_archived("opp-1", &req(Some("alice"))).unwrap();
        assert_eq!(serde_json::to_value(resp).unwrap(), json!({ "success": true, "archived": false }));
    }

    #[test]
    fn test_each_operation_targets_its_field() {
        let (store, api) = api();
        let r = req(Some("alice"));
        assert!(api.toggle_seen("opp-1", &r).unwrap().active);
        assert!(api.toggle_saved("opp-1", &r).unwrap().active);
        assert!(api.toggle_pursued("opp-1", &r).unwrap().active);

        let record = store.read(&RecordKey::new("opp-1", "2025-01-15")).unwrap();
        let alice = UserId::new("alice");
        assert!(record.is_active(InteractionField::Saved, &alice));
        assert!(record.is_active(InteractionField::Pursued, &alice));
        assert!(!record.is_active(InteractionField::Archived, &alice));
        // seen was toggled on, then refreshed by the later activations
        assert!(record.is_active(InteractionField::Seen, &alice));
    }

    #[test]
    fn test_missing_user_is_400() {
        let (_store, api) = api();
        let err = api.toggle_saved("opp-1", &req(None)).unwrap_err();
        assert_eq!(err.status(), 400);
        let err = api.toggle_saved("opp-1", &req(Some(""))).unwrap_err();
        assert_eq!(err.status(), 400);
        assert_eq!(
            serde_json::to_value(ErrorResponse::from(&err)).unwrap()["status"],
            400
        );
    }

    #[test]
    fn test_missing_record_is_404() {
        let (_store, api) = api();
        let err = api.toggle_pursued("nope", &req(Some("alice"))).unwrap_err();
        assert_eq!(err.status(), 404);
    }

    #[test]
    fn test_partition_date_alias() {
        let body: ToggleRequest =
            serde_json::from_value(json!({ "userId": "alice", "partitionDate": "2025-01-15" })).unwrap();
        assert_eq!(body.partition_key.as_deref(), Some("2025-01-15"));
        let (_store, api) = api();
        assert!(api.mark_seen("opp-1", &body).unwrap().active);
    }

    #[test]
    fn test_bulk_pursue_requires_user() {
        let (_store, api) = api();
        assert_eq!(api.bulk_pursue(None, &[]).unwrap_err().status(), 400);
        let resp = api
            .bulk_pursue(Some("alice"), &[RecordKey::new("opp-1", "2025-01-15")])
            .unwrap();
        assert_eq!(serde_json::to_value(resp).unwrap(), json!({ "success": true, "updatedCount": 1 }));
    }
}
