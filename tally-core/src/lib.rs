//! # tally-core: Interaction state model
//!
//! Per record and per user, four independent interaction fields are tracked:
//! `seenBy`, `savedBy`, `archivedBy` and `pursuedBy`. Each field is a map from
//! user id to the time of the last change; presence of the key means active.
//!
//! This crate holds the pure data model and merge rules. Storage, fan-out and
//! client reconciliation live in `tally-collab`.
//!
//! ## Modules
//!
//! - [`field`]: Field names, per-slot state, actions and user identity
//! - [`record`]: The shared record and its toggle rules
//! - [`event`]: Confirmed change events for broadcast
//! - [`legacy`]: Normalization of historical document shapes
//! - [`error`]: Toggle error taxonomy

pub mod error;
pub mod event;
pub mod field;
pub mod legacy;
pub mod record;

pub use error::ToggleError;
pub use event::ToggleEvent;
pub use field::{Action, FieldState, InteractionField, UserId, ANONYMOUS_USER};
pub use legacy::{normalize_field, normalize_record, LegacyError};
pub use record::{InteractionMap, InteractionRecord, RecordKey};
