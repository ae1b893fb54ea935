//! Client-side cache that merges optimistic edits, server confirmations and
//! remote broadcasts into one view.
//!
//! ```text
//!  begin_toggle ──► pending overlay ──► confirm / fail ──► confirmed base
//!                        │                                    ▲
//!  apply_remote ─────────┴── slot pending? ── yes ─► deferred ┘
//!                                           └─ no ──► confirmed base
//! ```
//!
//! The confirmed base only ever holds server-confirmed state (fetched
//! snapshots, toggle results, broadcasts). Pending overlays are provisional
//! and are cleared when the server answers. A remote event for a slot with
//! a pending edit is deferred until that edit resolves; events for other
//! slots apply immediately.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tally_core::{Action, FieldState, InteractionField, InteractionRecord, ToggleEvent, UserId};
use thiserror::Error;

/// One (field, user) position inside a record.
pub type Slot = (InteractionField, UserId);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    #[error("record {0} is not cached")]
    UnknownRecord(String),
    #[error("{field} on {record_id} already has an edit in flight")]
    AlreadyPending {
        record_id: String,
        field: InteractionField,
    },
    #[error("no pending edit for {field} on {record_id}")]
    NoPending {
        record_id: String,
        field: InteractionField,
    },
}

/// What happened to an inbound broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The event came from our own identity and was discarded.
    SelfEcho,
    Applied,
    /// Held until the pending edit on the same slot resolves.
    Deferred,
    /// The record is not in the cache; a later fetch will bring it in.
    UnknownRecord,
}

/// Visible state of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotView {
    Confirmed(FieldState),
    Pending(FieldState),
}

impl SlotView {
    pub fn state(&self) -> FieldState {
        match self {
            Self::Confirmed(s) | Self::Pending(s) => *s,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct PendingEdit {
    optimistic: FieldState,
    /// The optimistic activation also marks the record seen.
    implies_seen: bool,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
struct DeferredOp {
    action: Action,
    timestamp: DateTime<Utc>,
}

/// Client mirror of one record.
#[derive(Debug, Clone)]
pub struct ClientCacheEntry {
    confirmed: InteractionRecord,
    pending: HashMap<Slot, PendingEdit>,
    deferred: HashMap<Slot, Vec<DeferredOp>>,
}

impl ClientCacheEntry {
    fn new(record: InteractionRecord) -> Self {
        Self {
            confirmed: record,
            pending: HashMap::new(),
            deferred: HashMap::new(),
        }
    }

    /// The last server-confirmed state.
    pub fn confirmed(&self) -> &InteractionRecord {
        &self.confirmed
    }

    pub fn is_pending(&self, field: InteractionField, user: &UserId) -> bool {
        self.pending.contains_key(&(field, user.clone()))
    }

    pub fn pending_slots(&self) -> impl Iterator<Item = &Slot> {
        self.pending.keys()
    }

    fn slot(&self, field: InteractionField, user: &UserId) -> SlotView {
        let key = (field, user.clone());
        if let Some(edit) = self.pending.get(&key) {
            return SlotView::Pending(edit.optimistic);
        }
        if field == InteractionField::Seen {
            // An optimistic save/archive/pursue shows the record as seen.
            let implied = self
                .pending
                .iter()
                .find(|((_, u), edit)| u == user && edit.implies_seen)
                .map(|(_, edit)| edit.started_at);
            if let Some(at) = implied {
                if !self.confirmed.is_active(field, user) {
                    return SlotView::Pending(FieldState::Active(at));
                }
            }
        }
        SlotView::Confirmed(self.confirmed.state(field, user))
    }

    /// Confirmed base with pending overlays applied.
    fn view(&self) -> InteractionRecord {
        let mut merged = self.confirmed.clone();
        for ((field, user), edit) in &self.pending {
            merged.field_mut(*field).set(user, edit.optimistic);
        }
        for ((_, user), edit) in &self.pending {
            if edit.implies_seen && !self.pending.contains_key(&(InteractionField::Seen, user.clone())) {
                if !merged.is_active(InteractionField::Seen, user) {
                    merged.seen_by.activate(user, edit.started_at);
                }
            }
        }
        merged
    }

    fn write_confirmed(&mut self, field: InteractionField, user: &UserId, action: Action, at: DateTime<Utc>) {
        match action {
            Action::Activate => self.confirmed.field_mut(field).activate(user, at),
            Action::Deactivate => {
                self.confirmed.field_mut(field).deactivate(user);
            }
        }
    }

    /// Apply one slot operation now, or defer it behind a pending edit.
    fn apply_or_defer(&mut self, field: InteractionField, user: &UserId, action: Action, at: DateTime<Utc>) -> bool {
        let key = (field, user.clone());
        if self.pending.contains_key(&key) {
            self.deferred.entry(key).or_default().push(DeferredOp { action, timestamp: at });
            false
        } else {
            self.write_confirmed(field, user, action, at);
            true
        }
    }

    /// Replay deferred ops for a slot whose pending edit just resolved.
    fn flush_deferred(&mut self, field: InteractionField, user: &UserId, newer_than: Option<DateTime<Utc>>) {
        let Some(ops) = self.deferred.remove(&(field, user.clone())) else {
            return;
        };
        for op in ops {
            match newer_than {
                Some(cutoff) if op.timestamp <= cutoff => {
                    log::debug!("Discarding stale deferred {field} for {user} on {}", self.confirmed.id);
                }
                _ => self.write_confirmed(field, user, op.action, op.timestamp),
            }
        }
    }
}

/// Per-client reconciliation state for all cached records.
pub struct ClientReconciler {
    user_id: UserId,
    entries: HashMap<String, ClientCacheEntry>,
}

impl ClientReconciler {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            entries: HashMap::new(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Add or replace the confirmed base of a record from a full fetch.
    ///
    /// Pending overlays and deferred events survive the refresh.
    pub fn resync(&mut self, record: InteractionRecord) {
        match self.entries.get_mut(&record.id) {
            Some(entry) => entry.confirmed = record,
            None => {
                self.entries.insert(record.id.clone(), ClientCacheEntry::new(record));
            }
        }
    }

    pub fn forget(&mut self, record_id: &str) -> Option<ClientCacheEntry> {
        self.entries.remove(record_id)
    }

    pub fn entry(&self, record_id: &str) -> Option<&ClientCacheEntry> {
        self.entries.get(record_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &InteractionRecord> {
        self.entries.values().map(|e| &e.confirmed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Optimistically flip `field` for the local user.
    ///
    /// Returns the assumed new state. Only one edit per (record, field) may
    /// be in flight.
    pub fn begin_toggle(&mut self, record_id: &str, field: InteractionField) -> Result<bool, ReconcileError> {
        let user = self.user_id.clone();
        self.begin_toggle_as(record_id, field, &user)
    }

    /// Optimistically flip `field` for `user` (delegated edits).
    pub fn begin_toggle_as(
        &mut self,
        record_id: &str,
        field: InteractionField,
        user: &UserId,
    ) -> Result<bool, ReconcileError> {
        let entry = self.entry_mut(record_id)?;
        if entry.is_pending(field, user) {
            return Err(ReconcileError::AlreadyPending {
                record_id: record_id.to_string(),
                field,
            });
        }

        let now = Utc::now();
        // Flip what the user currently sees, including implied seen.
        let active = !entry.slot(field, user).is_active();
        let optimistic = if active { FieldState::Active(now) } else { FieldState::Inactive };
        entry.pending.insert(
            (field, user.clone()),
            PendingEdit {
                optimistic,
                implies_seen: active && field.implies_seen(),
                started_at: now,
            },
        );
        Ok(active)
    }

    /// Replace the pending edit with the server-confirmed state.
    ///
    /// `active` may differ from the optimistic guess if another write landed
    /// first. Deferred events older than the confirmation are discarded.
    pub fn confirm(
        &mut self,
        record_id: &str,
        field: InteractionField,
        active: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let user = self.user_id.clone();
        self.confirm_as(record_id, field, &user, active, timestamp)
    }

    pub fn confirm_as(
        &mut self,
        record_id: &str,
        field: InteractionField,
        user: &UserId,
        active: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let entry = self.entry_mut(record_id)?;
        if entry.pending.remove(&(field, user.clone())).is_none() {
            return Err(ReconcileError::NoPending {
                record_id: record_id.to_string(),
                field,
            });
        }
        entry.confirmed.apply(field, user, Action::from_state(active), timestamp);
        entry.flush_deferred(field, user, Some(timestamp));
        Ok(())
    }

    /// Drop the pending edit after a failed request, reverting to the
    /// confirmed base, then apply anything deferred behind it.
    pub fn fail(&mut self, record_id: &str, field: InteractionField) -> Result<(), ReconcileError> {
        let user = self.user_id.clone();
        self.fail_as(record_id, field, &user)
    }

    pub fn fail_as(&mut self, record_id: &str, field: InteractionField, user: &UserId) -> Result<(), ReconcileError> {
        let entry = self.entry_mut(record_id)?;
        if entry.pending.remove(&(field, user.clone())).is_none() {
            return Err(ReconcileError::NoPending {
                record_id: record_id.to_string(),
                field,
            });
        }
        entry.flush_deferred(field, user, None);
        Ok(())
    }

    /// Record a server-confirmed change that had no optimistic phase.
    pub fn record_confirmed(
        &mut self,
        record_id: &str,
        field: InteractionField,
        active: bool,
        timestamp: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let user = self.user_id.clone();
        let entry = self.entry_mut(record_id)?;
        let action = Action::from_state(active);
        if entry.apply_or_defer(field, &user, action, timestamp) && active && field.implies_seen() {
            entry.apply_or_defer(InteractionField::Seen, &user, Action::Activate, timestamp);
        }
        Ok(())
    }

    /// Merge an inbound broadcast.
    pub fn apply_remote(&mut self, event: &ToggleEvent) -> RemoteOutcome {
        // Independent of server-side suppression.
        if event.is_from(&self.user_id) {
            return RemoteOutcome::SelfEcho;
        }
        let Some(entry) = self.entries.get_mut(&event.record_id) else {
            return RemoteOutcome::UnknownRecord;
        };

        let applied = entry.apply_or_defer(event.field, &event.user_id, event.action, event.timestamp);
        if event.action.is_activate() && event.field.implies_seen() {
            entry.apply_or_defer(InteractionField::Seen, &event.user_id, Action::Activate, event.timestamp);
        }

        if applied {
            RemoteOutcome::Applied
        } else {
            RemoteOutcome::Deferred
        }
    }

    pub fn slot(&self, record_id: &str, field: InteractionField, user: &UserId) -> Option<SlotView> {
        self.entries.get(record_id).map(|e| e.slot(field, user))
    }

    pub fn is_active(&self, record_id: &str, field: InteractionField, user: &UserId) -> bool {
        self.slot(record_id, field, user).is_some_and(|s| s.is_active())
    }

    /// Is the local user's `field` on `record_id` waiting on the server?
    pub fn is_pending(&self, record_id: &str, field: InteractionField) -> bool {
        self.entries
            .get(record_id)
            .is_some_and(|e| e.is_pending(field, &self.user_id))
    }

    /// Merged view of a record: confirmed state plus pending overlays.
    pub fn view(&self, record_id: &str) -> Option<InteractionRecord> {
        self.entries.get(record_id).map(ClientCacheEntry::view)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.values().map(|e| e.pending.len()).sum()
    }

    pub fn deferred_count(&self) -> usize {
        self.entries
            .values()
            .flat_map(|e| e.deferred.values())
            .map(Vec::len)
            .sum()
    }

    fn entry_mut(&mut self, record_id: &str) -> Result<&mut ClientCacheEntry, ReconcileError> {
        self.entries
            .get_mut(record_id)
            .ok_or_else(|| ReconcileError::UnknownRecord(record_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    fn reconciler() -> ClientReconciler {
        let mut r = ClientReconciler::new(alice());
        r.resync(InteractionRecord::new("R", "p"));
        r
    }

    fn event(user: UserId, field: InteractionField, action: Action, at: DateTime<Utc>) -> ToggleEvent {
        ToggleEvent::new("R", field, user, action, at)
    }

    #[test]
    fn test_optimistic_then_remote_other_user() {
        let mut r = reconciler();
        assert!(r.begin_toggle("R", InteractionField::Saved).unwrap());
        assert!(r.is_pending("R", InteractionField::Saved));

        let t2 = Utc::now();
        let outcome = r.apply_remote(&event(bob(), InteractionField::Saved, Action::Activate, t2));
        assert_eq!(outcome, RemoteOutcome::Applied);

        assert!(r.slot("R", InteractionField::Saved, &alice()).unwrap().is_pending());
        assert!(r.slot("R", InteractionField::Saved, &alice()).unwrap().is_active());
        assert_eq!(
            r.slot("R", InteractionField::Saved, &bob()),
            Some(SlotView::Confirmed(FieldState::Active(t2)))
        );
        let view = r.view("R").unwrap();
        assert_eq!(view.saved_by.len(), 2);
        assert!(view.is_active(InteractionField::Seen, &alice()));
        assert!(view.is_active(InteractionField::Seen, &bob()));
    }

    #[test]
    fn test_self_echo_is_discarded() {
        let mut r = reconciler();
        let outcome = r.apply_remote(&event(alice(), InteractionField::Archived, Action::Activate, Utc::now()));
        assert_eq!(outcome, RemoteOutcome::SelfEcho);
        assert!(!r.is_active("R", InteractionField::Archived, &alice()));
        assert!(!r.is_active("R", InteractionField::Seen, &alice()));
    }

    #[test]
    fn test_confirm_uses_server_state() {
        let mut r = reconciler();
        assert!(r.begin_toggle("R", InteractionField::Archived).unwrap());
        // Another session archived first, so the server flipped it off.
        let t = Utc::now();
        r.confirm("R", InteractionField::Archived, false, t).unwrap();

        assert!(!r.is_pending("R", InteractionField::Archived));
        assert_eq!(
            r.slot("R", InteractionField::Archived, &alice()),
            Some(SlotView::Confirmed(FieldState::Inactive))
        );
        assert_eq!(r.pending_count(), 0);
    }

    #[test]
    fn test_confirm_activation_sets_seen() {
        let mut r = reconciler();
        r.begin_toggle("R", InteractionField::Pursued).unwrap();
        assert!(r.slot("R", InteractionField::Seen, &alice()).unwrap().is_pending());

        let t = Utc::now();
        r.confirm("R", InteractionField::Pursued, true, t).unwrap();
        assert_eq!(
            r.slot("R", InteractionField::Seen, &alice()),
            Some(SlotView::Confirmed(FieldState::Active(t)))
        );
    }

    #[test]
    fn test_toggle_seen_flips_implied_seen() {
        let mut r = reconciler();
        r.begin_toggle("R", InteractionField::Saved).unwrap();
        assert!(r.is_active("R", InteractionField::Seen, &alice()));

        // Seen is shown as active, so clicking it means unset.
        assert!(!r.begin_toggle("R", InteractionField::Seen).unwrap());
        assert_eq!(
            r.slot("R", InteractionField::Seen, &alice()),
            Some(SlotView::Pending(FieldState::Inactive))
        );
    }

    #[test]
    fn test_fail_rolls_back() {
        let mut r = reconciler();
        r.begin_toggle("R", InteractionField::Saved).unwrap();
        r.fail("R", InteractionField::Saved).unwrap();
        assert!(!r.is_active("R", InteractionField::Saved, &alice()));
        assert!(!r.is_active("R", InteractionField::Seen, &alice()));
        assert_eq!(
            r.fail("R", InteractionField::Saved),
            Err(ReconcileError::NoPending { record_id: "R".into(), field: InteractionField::Saved })
        );
    }

    #[test]
    fn test_single_in_flight_per_field() {
        let mut r = reconciler();
        r.begin_toggle("R", InteractionField::Saved).unwrap();
        assert!(matches!(
            r.begin_toggle("R", InteractionField::Saved),
            Err(ReconcileError::AlreadyPending { .. })
        ));
        // Other fields are independent.
        assert!(r.begin_toggle("R", InteractionField::Archived).is_ok());
        assert_eq!(r.pending_count(), 2);
    }

    #[test]
    fn test_remote_event_for_pending_slot_is_deferred() {
        let mut r = reconciler();
        // Delegated edit on bob's slot.
        r.begin_toggle_as("R", InteractionField::Saved, &bob()).unwrap();

        let t_event = Utc::now() + Duration::seconds(5);
        let outcome = r.apply_remote(&event(bob(), InteractionField::Saved, Action::Deactivate, t_event));
        assert_eq!(outcome, RemoteOutcome::Deferred);
        assert_eq!(r.deferred_count(), 1);
        assert!(r.slot("R", InteractionField::Saved, &bob()).unwrap().is_pending());

        // Confirmation predates the deferred event, so the event wins afterwards.
        r.confirm_as("R", InteractionField::Saved, &bob(), true, Utc::now()).unwrap();
        assert_eq!(r.deferred_count(), 0);
        assert!(!r.is_active("R", InteractionField::Saved, &bob()));
    }

    #[test]
    fn test_stale_deferred_event_is_dropped() {
        let mut r = reconciler();
        r.begin_toggle_as("R", InteractionField::Archived, &bob()).unwrap();
        let old = Utc::now() - Duration::seconds(30);
        r.apply_remote(&event(bob(), InteractionField::Archived, Action::Deactivate, old));

        let t = Utc::now();
        r.confirm_as("R", InteractionField::Archived, &bob(), true, t).unwrap();
        assert_eq!(
            r.slot("R", InteractionField::Archived, &bob()),
            Some(SlotView::Confirmed(FieldState::Active(t)))
        );
    }

    #[test]
    fn test_fail_replays_deferred() {
        let mut r = reconciler();
        r.begin_toggle_as("R", InteractionField::Saved, &bob()).unwrap();
        r.apply_remote(&event(bob(), InteractionField::Saved, Action::Activate, Utc::now()));
        r.fail_as("R", InteractionField::Saved, &bob()).unwrap();
        assert!(r.is_active("R", InteractionField::Saved, &bob()));
        assert!(!r.slot("R", InteractionField::Saved, &bob()).unwrap().is_pending());
    }

    #[test]
    fn test_remote_deactivate_keeps_seen() {
        let mut r = reconciler();
        let t = Utc::now();
        r.apply_remote(&event(bob(), InteractionField::Archived, Action::Activate, t));
        r.apply_remote(&event(bob(), InteractionField::Archived, Action::Deactivate, t));
        assert!(!r.is_active("R", InteractionField::Archived, &bob()));
        assert!(r.is_active("R", InteractionField::Seen, &bob()));
    }

    #[test]
    fn test_unknown_record() {
        let mut r = reconciler();
        let ev = ToggleEvent::new("other", InteractionField::Saved, bob(), Action::Activate, Utc::now());
        assert_eq!(r.apply_remote(&ev), RemoteOutcome::UnknownRecord);
        assert_eq!(
            r.begin_toggle("other", InteractionField::Saved),
            Err(ReconcileError::UnknownRecord("other".into()))
        );
    }

    #[test]
    fn test_resync_keeps_pending_overlay() {
        let mut r = reconciler();
        r.begin_toggle("R", InteractionField::Saved).unwrap();

        let mut fetched = InteractionRecord::new("R", "p");
        fetched.version = 9;
        fetched.toggle(InteractionField::Archived, &bob(), Utc::now());
        r.resync(fetched);

        assert_eq!(r.entry("R").unwrap().confirmed().version, 9);
        assert!(r.is_active("R", InteractionField::Archived, &bob()));
        assert!(r.slot("R", InteractionField::Saved, &alice()).unwrap().is_pending());
    }

    #[test]
    fn test_record_confirmed_without_optimism() {
        let mut r = reconciler();
        let t = Utc::now();
        r.record_confirmed("R", InteractionField::Seen, true, t).unwrap();
        assert_eq!(
            r.slot("R", InteractionField::Seen, &alice()),
            Some(SlotView::Confirmed(FieldState::Active(t)))
        );
    }
}
