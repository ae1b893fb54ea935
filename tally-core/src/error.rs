//! Error taxonomy shared by the toggle path.

use thiserror::Error;

use crate::record::RecordKey;

/// Failure of a single toggle call.
///
/// `Conflict` is only reported once the bounded compare-and-swap retries are
/// exhausted; individual version conflicts are retried internally.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToggleError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("record not found: {0}")]
    NotFound(RecordKey),
    #[error("write conflict on {key} after {attempts} attempts")]
    Conflict { key: RecordKey, attempts: u32 },
    #[error("store error: {0}")]
    Store(String),
}

impl ToggleError {
    /// HTTP-equivalent status code for transport layers.
    pub fn status(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict { .. } => 409,
            Self::Store(_) => 500,
        }
    }
}
