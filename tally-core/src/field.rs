//! Interaction fields, per-slot state and user identity.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity used when the identity provider yields nothing.
pub const ANONYMOUS_USER: &str = "anonymous";

/// The four independent interaction fields tracked per record and user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InteractionField {
    #[serde(rename = "seenBy")]
    Seen,
    #[serde(rename = "savedBy")]
    Saved,
    #[serde(rename = "archivedBy")]
    Archived,
    #[serde(rename = "pursuedBy")]
    Pursued,
}

impl InteractionField {
    pub const ALL: [InteractionField; 4] = [
        InteractionField::Seen,
        InteractionField::Saved,
        InteractionField::Archived,
        InteractionField::Pursued,
    ];

    /// Canonical storage / wire name of the field map.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seen => "seenBy",
            Self::Saved => "savedBy",
            Self::Archived => "archivedBy",
            Self::Pursued => "pursuedBy",
        }
    }

    /// Key used for the boolean in toggle responses (`{ success, saved }`).
    pub fn response_key(&self) -> &'static str {
        match self {
            Self::Seen => "seen",
            Self::Saved => "saved",
            Self::Archived => "archived",
            Self::Pursued => "pursued",
        }
    }

    /// Activating any field other than `seenBy` also marks the record seen.
    pub fn implies_seen(&self) -> bool {
        !matches!(self, Self::Seen)
    }

    /// Parse a field name, accepting the historical names too.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "seenBy" | "seen" => Some(Self::Seen),
            "savedBy" | "saved" | "userSaves" => Some(Self::Saved),
            "archivedBy" | "archived" => Some(Self::Archived),
            "pursuedBy" | "pursued" => Some(Self::Pursued),
            _ => None,
        }
    }
}

impl fmt::Display for InteractionField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a confirmed toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Activate,
    Deactivate,
}

impl Action {
    /// The action that produces `active` as the new state.
    pub fn from_state(active: bool) -> Self {
        if active {
            Self::Activate
        } else {
            Self::Deactivate
        }
    }

    pub fn is_activate(&self) -> bool {
        matches!(self, Self::Activate)
    }
}

/// State of one (record, field, user) slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldState {
    Active(DateTime<Utc>),
    #[default]
    Inactive,
}

impl FieldState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Active(at) => Some(*at),
            Self::Inactive => None,
        }
    }
}

/// Opaque, stable user identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The sentinel identity used when no user is signed in.
    pub fn anonymous() -> Self {
        Self(ANONYMOUS_USER.to_string())
    }

    /// Resolve an optional identity, defaulting to the anonymous sentinel.
    pub fn or_anonymous(id: Option<&str>) -> Self {
        match id.map(str::trim) {
            Some(id) if !id.is_empty() => Self::new(id),
            _ => Self::anonymous(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    pub fn is_anonymous(&self) -> bool {
        self.0 == ANONYMOUS_USER
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
