//! The shared interaction record and its per-user field maps.
//!
//! A user's presence as a key in a field map means the field is active for
//! that user. Activating `savedBy`, `archivedBy` or `pursuedBy` also sets
//! `seenBy`; deactivating never removes `seenBy`.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::field::{Action, FieldState, InteractionField, UserId};

/// Store address of a record: opaque id plus locality key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordKey {
    pub id: String,
    pub partition_key: String,
}

impl RecordKey {
    pub fn new(id: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_key: partition_key.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.partition_key)
    }
}

/// User id → last-change timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InteractionMap(BTreeMap<UserId, DateTime<Utc>>);

impl InteractionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, user: &UserId) -> FieldState {
        match self.0.get(user) {
            Some(at) => FieldState::Active(*at),
            None => FieldState::Inactive,
        }
    }

    pub fn contains(&self, user: &UserId) -> bool {
        self.0.contains_key(user)
    }

    /// Insert or refresh the user's timestamp.
    pub fn activate(&mut self, user: &UserId, at: DateTime<Utc>) {
        self.0.insert(user.clone(), at);
    }

    /// Remove the user; returns whether they were present.
    pub fn deactivate(&mut self, user: &UserId) -> bool {
        self.0.remove(user).is_some()
    }

    pub fn set(&mut self, user: &UserId, state: FieldState) {
        match state {
            FieldState::Active(at) => self.activate(user, at),
            FieldState::Inactive => {
                self.deactivate(user);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn users(&self) -> impl Iterator<Item = &UserId> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UserId, &DateTime<Utc>)> {
        self.0.iter()
    }
}

impl FromIterator<(UserId, DateTime<Utc>)> for InteractionMap {
    fn from_iter<T: IntoIterator<Item = (UserId, DateTime<Utc>)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The shared entity whose interaction state is synchronized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InteractionRecord {
    pub id: String,
    pub partition_key: String,
    /// Optimistic concurrency token, bumped by the store on every replace.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub seen_by: InteractionMap,
    #[serde(default)]
    pub saved_by: InteractionMap,
    #[serde(default)]
    pub archived_by: InteractionMap,
    #[serde(default)]
    pub pursued_by: InteractionMap,
}

impl InteractionRecord {
    /// A fresh record with all four fields empty.
    pub fn new(id: impl Into<String>, partition_key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            partition_key: partition_key.into(),
            version: 0,
            seen_by: InteractionMap::new(),
            saved_by: InteractionMap::new(),
            archived_by: InteractionMap::new(),
            pursued_by: InteractionMap::new(),
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.id.clone(), self.partition_key.clone())
    }

    pub fn field(&self, field: InteractionField) -> &InteractionMap {
        match field {
            InteractionField::Seen => &self.seen_by,
            InteractionField::Saved => &self.saved_by,
            InteractionField::Archived => &self.archived_by,
            InteractionField::Pursued => &self.pursued_by,
        }
    }

    pub fn field_mut(&mut self, field: InteractionField) -> &mut InteractionMap {
        match field {
            InteractionField::Seen => &mut self.seen_by,
            InteractionField::Saved => &mut self.saved_by,
            InteractionField::Archived => &mut self.archived_by,
            InteractionField::Pursued => &mut self.pursued_by,
        }
    }

    pub fn state(&self, field: InteractionField, user: &UserId) -> FieldState {
        self.field(field).state(user)
    }

    pub fn is_active(&self, field: InteractionField, user: &UserId) -> bool {
        self.field(field).contains(user)
    }

    /// Flip the user's key in `field`. Returns the new state.
    pub fn toggle(&mut self, field: InteractionField, user: &UserId, now: DateTime<Utc>) -> bool {
        let was_active = self.is_active(field, user);
        let action = Action::from_state(!was_active);
        self.apply(field, user, action, now);
        !was_active
    }

    /// Apply a confirmed action, including the `seenBy` side effect.
    pub fn apply(&mut self, field: InteractionField, user: &UserId, action: Action, at: DateTime<Utc>) {
        match action {
            Action::Activate => {
                self.field_mut(field).activate(user, at);
                if field.implies_seen() {
                    self.seen_by.activate(user, at);
                }
            }
            Action::Deactivate => {
                self.field_mut(field).deactivate(user);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_new_record_is_empty() {
        let record = InteractionRecord::new("r1", "2025-01-15");
        for field in InteractionField::ALL {
            assert!(record.field(field).is_empty());
        }
        assert_eq!(record.version, 0);
        assert_eq!(record.key(), RecordKey::new("r1", "2025-01-15"));
    }

    #[test]
    fn test_toggle_archive_sets_seen_and_keeps_it() {
        let alice = UserId::new("alice");
        let mut record = InteractionRecord::new("r1", "p");

        assert!(record.toggle(InteractionField::Archived, &alice, t(1)));
        assert_eq!(record.state(InteractionField::Archived, &alice), FieldState::Active(t(1)));
        assert_eq!(record.state(InteractionField::Seen, &alice), FieldState::Active(t(1)));

        assert!(!record.toggle(InteractionField::Archived, &alice, t(2)));
        assert!(record.archived_by.is_empty());
        assert_eq!(record.state(InteractionField::Seen, &alice), FieldState::Active(t(1)));
    }

    #[test]
    fn test_toggle_seen_has_no_side_effect() {
        let bob = UserId::new("bob");
        let mut record = InteractionRecord::new("r1", "p");
        assert!(record.toggle(InteractionField::Seen, &bob, t(5)));
        assert!(!record.toggle(InteractionField::Seen, &bob, t(6)));
        assert!(record.seen_by.is_empty());
        assert!(record.saved_by.is_empty());
    }

    #[test]
    fn test_double_toggle_restores_state() {
        let alice = UserId::new("alice");
        for field in InteractionField::ALL {
            let mut record = InteractionRecord::new("r1", "p");
            let before = record.is_active(field, &alice);
            record.toggle(field, &alice, t(1));
            record.toggle(field, &alice, t(2));
            assert_eq!(record.is_active(field, &alice), before);
        }
    }

    #[test]
    fn test_other_users_untouched() {
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");
        let mut record = InteractionRecord::new("r1", "p");
        record.toggle(InteractionField::Saved, &bob, t(1));
        record.toggle(InteractionField::Saved, &alice, t(2));
        record.toggle(InteractionField::Saved, &alice, t(3));
        assert!(record.is_active(InteractionField::Saved, &bob));
        assert!(!record.is_active(InteractionField::Saved, &alice));
    }

    #[test]
    fn test_serde_shape() {
        let alice = UserId::new("alice");
        let mut record = InteractionRecord::new("r1", "p");
        record.toggle(InteractionField::Pursued, &alice, t(0));
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["partitionKey"], "p");
        assert_eq!(json["pursuedBy"]["alice"], "1970-01-01T00:00:00Z");
        assert!(json["savedBy"].as_object().unwrap().is_empty());
    }
}
