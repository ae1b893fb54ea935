//! Confirmed state changes fanned out to other connections.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::field::{Action, InteractionField, UserId};
use crate::record::InteractionRecord;

/// Immutable record of one successful toggle.
///
/// Produced once per confirmed write and consumed by every subscriber
/// except the acting user's own connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleEvent {
    pub record_id: String,
    pub field: InteractionField,
    pub user_id: UserId,
    pub action: Action,
    pub timestamp: DateTime<Utc>,
}

impl ToggleEvent {
    pub fn new(
        record_id: impl Into<String>,
        field: InteractionField,
        user_id: UserId,
        action: Action,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            field,
            user_id,
            action,
            timestamp,
        }
    }

    /// Whether this event was caused by `user`.
    pub fn is_from(&self, user: &UserId) -> bool {
        &self.user_id == user
    }

    /// Replay the event onto a record, with the `seenBy` side effect.
    pub fn apply_to(&self, record: &mut InteractionRecord) {
        record.apply(self.field, &self.user_id, self.action, self.timestamp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_activate_marks_seen() {
        let bob = UserId::new("bob");
        let now = Utc::now();
        let event = ToggleEvent::new("r1", InteractionField::Saved, bob.clone(), Action::Activate, now);
        let mut record = InteractionRecord::new("r1", "p");
        event.apply_to(&mut record);
        assert!(record.is_active(InteractionField::Saved, &bob));
        assert!(record.is_active(InteractionField::Seen, &bob));
        assert!(event.is_from(&bob));
        assert!(!event.is_from(&UserId::new("alice")));
    }

    #[test]
    fn test_apply_deactivate_keeps_seen() {
        let bob = UserId::new("bob");
        let now = Utc::now();
        let mut record = InteractionRecord::new("r1", "p");
        record.toggle(InteractionField::Pursued, &bob, now);
        ToggleEvent::new("r1", InteractionField::Pursued, bob.clone(), Action::Deactivate, now)
            .apply_to(&mut record);
        assert!(!record.is_active(InteractionField::Pursued, &bob));
        assert!(record.is_active(InteractionField::Seen, &bob));
    }
}
