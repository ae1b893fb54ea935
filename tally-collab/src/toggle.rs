//! Interaction toggle service: one field, one record, one user per call.
//!
//! Every mutation is a compare-and-swap loop against the record store:
//! read the record with its version, apply the change, then
//! `conditional_replace` with the version read. A version conflict means
//! another writer got in between, so the loop re-reads and re-applies. After
//! `max_attempts` conflicts the call fails with `ToggleError::Conflict`
//! instead of dropping the update.
//!
//! Confirmed changes are handed to the [`EventSink`] after the write
//! succeeds. Fan-out never affects the caller's result.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tally_core::{Action, InteractionField, InteractionRecord, RecordKey, ToggleError, ToggleEvent, UserId};

use crate::broadcast::EventSink;
use crate::storage::{RecordStore, StoreError};

/// Default bound on compare-and-swap attempts per call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Result of a confirmed write.
#[derive(Debug, Clone, PartialEq)]
pub struct ToggleOutcome {
    pub key: RecordKey,
    pub field: InteractionField,
    pub user_id: UserId,
    /// New state of the field for the user.
    pub active: bool,
    pub timestamp: DateTime<Utc>,
    /// Store version after the write.
    pub version: u64,
    /// Number of compare-and-swap attempts used (1 = no conflict).
    pub attempts: u32,
}

impl ToggleOutcome {
    pub fn event(&self) -> ToggleEvent {
        ToggleEvent::new(
            self.key.id.clone(),
            self.field,
            self.user_id.clone(),
            Action::from_state(self.active),
            self.timestamp,
        )
    }
}

/// Counters for monitoring the toggle path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToggleStats {
    pub writes: u64,
    pub version_conflicts: u64,
    pub exhausted: u64,
}

#[derive(Default)]
struct AtomicToggleStats {
    writes: AtomicU64,
    version_conflicts: AtomicU64,
    exhausted: AtomicU64,
}

pub struct ToggleService {
    store: Arc<dyn RecordStore>,
    sink: Option<Arc<dyn EventSink>>,
    max_attempts: u32,
    stats: AtomicToggleStats,
}

impl ToggleService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            sink: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            stats: AtomicToggleStats::default(),
        }
    }

    /// Publish confirmed changes to `sink`.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    /// Flip `field` for `user_id` on the record. Returns the confirmed new state.
    pub fn toggle(
        &self,
        key: &RecordKey,
        user_id: &UserId,
        field: InteractionField,
    ) -> Result<ToggleOutcome, ToggleError> {
        validate(key, user_id)?;
        let outcome = self.update(key, user_id, field, |record, now| {
            Some(record.toggle(field, user_id, now))
        })?;
        // The toggle closure always requests a write.
        outcome.ok_or_else(|| ToggleError::Store(format!("toggle on {key} produced no write")))
    }

    /// Set or refresh `seenBy` for the user without toggling.
    pub fn mark_seen(&self, key: &RecordKey, user_id: &UserId) -> Result<ToggleOutcome, ToggleError> {
        validate(key, user_id)?;
        let outcome = self.update(key, user_id, InteractionField::Seen, |record, now| {
            record.apply(InteractionField::Seen, user_id, Action::Activate, now);
            Some(true)
        })?;
        outcome.ok_or_else(|| ToggleError::Store(format!("mark seen on {key} produced no write")))
    }

    /// Activate `pursuedBy` for the user on every listed record not already pursued.
    ///
    /// Each record is its own compare-and-swap loop. Missing records and
    /// exhausted conflicts are logged and skipped. Returns how many records
    /// were updated.
    pub fn bulk_pursue(&self, user_id: &UserId, keys: &[RecordKey]) -> Result<usize, ToggleError> {
        validate_user(user_id)?;
        let mut updated = 0;
        for key in keys {
            let result = self.update(key, user_id, InteractionField::Pursued, |record, now| {
                if record.is_active(InteractionField::Pursued, user_id) {
                    return None;
                }
                record.apply(InteractionField::Pursued, user_id, Action::Activate, now);
                Some(true)
            });
            match result {
                Ok(Some(_)) => updated += 1,
                Ok(None) => {}
                Err(ToggleError::NotFound(key)) => log::warn!("Bulk pursue skipped missing record {key}"),
                Err(e @ ToggleError::Conflict { .. }) => log::warn!("Bulk pursue skipped: {e}"),
                Err(e) => return Err(e),
            }
        }
        log::info!("Bulk pursue by {user_id}: {updated}/{} records updated", keys.len());
        Ok(updated)
    }

    /// Bounded compare-and-swap loop.
    ///
    /// `apply` mutates the freshly read record and returns the field's new
    /// state, or `None` when no write is needed.
    fn update<F>(
        &self,
        key: &RecordKey,
        user_id: &UserId,
        field: InteractionField,
        mut apply: F,
    ) -> Result<Option<ToggleOutcome>, ToggleError>
    where
        F: FnMut(&mut InteractionRecord, DateTime<Utc>) -> Option<bool>,
    {
        for attempt in 1..=self.max_attempts {
            let mut record = self.store.read(key)?;
            let expected = record.version;
            let now = Utc::now();

            let Some(active) = apply(&mut record, now) else {
                return Ok(None);
            };

            match self.store.conditional_replace(key, &record, expected) {
                Ok(version) => {
                    self.stats.writes.fetch_add(1, Ordering::Relaxed);
                    let outcome = ToggleOutcome {
                        key: key.clone(),
                        field,
                        user_id: user_id.clone(),
                        active,
                        timestamp: now,
                        version,
                        attempts: attempt,
                    };
                    log::debug!(
                        "{field} on {key} for {user_id} -> {active} (v{version}, attempt {attempt})"
                    );
                    self.publish(&outcome);
                    return Ok(Some(outcome));
                }
                Err(StoreError::VersionConflict { actual, .. }) => {
                    self.stats.version_conflicts.fetch_add(1, Ordering::Relaxed);
                    log::debug!(
                        "Version conflict on {key} (expected v{expected}, found v{actual}), attempt {attempt}/{}",
                        self.max_attempts
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.stats.exhausted.fetch_add(1, Ordering::Relaxed);
        log::warn!("Giving up on {field} for {user_id} on {key} after {} attempts", self.max_attempts);
        Err(ToggleError::Conflict {
            key: key.clone(),
            attempts: self.max_attempts,
        })
    }

    fn publish(&self, outcome: &ToggleOutcome) {
        if let Some(ref sink) = self.sink {
            sink.publish(&outcome.event());
        }
    }

    pub fn stats(&self) -> ToggleStats {
        ToggleStats {
            writes: self.stats.writes.load(Ordering::Relaxed),
            version_conflicts: self.stats.version_conflicts.load(Ordering::Relaxed),
            exhausted: self.stats.exhausted.load(Ordering::Relaxed),
        }
    }
}

fn validate_user(user_id: &UserId) -> Result<(), ToggleError> {
    if user_id.is_empty() {
        return Err(ToggleError::Validation("userId is required".into()));
    }
    if user_id.is_anonymous() {
        return Err(ToggleError::Validation("anonymous users cannot change interactions".into()));
    }
    Ok(())
}

fn validate(key: &RecordKey, user_id: &UserId) -> Result<(), ToggleError> {
    validate_user(user_id)?;
    if key.id.is_empty() {
        return Err(ToggleError::Validation("recordId is required".into()));
    }
    if key.partition_key.is_empty() {
        return Err(ToggleError::Validation("partitionKey is required".into()));
    }
    Ok(())
}
