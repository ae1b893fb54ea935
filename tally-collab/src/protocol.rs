//! JSON wire protocol between clients and the sync server.
//!
//! Every frame is a WebSocket text message holding one JSON object with a
//! `type` tag:
//! ```text
//! client → server   HELLO · PING · TOGGLE · MARK_SEEN · FETCH
//! server → client   WELCOME · PONG · TOGGLE_RESULT · SNAPSHOT · INTERACTION_UPDATE · ERROR
//! ```
//!
//! `INTERACTION_UPDATE` is the broadcast shape:
//! `{ type, recordId, field, action, userId, timestamp }`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_core::{InteractionField, InteractionRecord, RecordKey, ToggleError, ToggleEvent, UserId};
use thiserror::Error;
use uuid::Uuid;

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Identify the connection. Must precede any mutation.
    Hello {
        #[serde(default)]
        user_id: Option<String>,
    },
    Ping,
    Toggle {
        request_id: Uuid,
        record_id: String,
        partition_key: String,
        field: InteractionField,
    },
    MarkSeen {
        request_id: Uuid,
        record_id: String,
        partition_key: String,
    },
    Fetch {
        request_id: Uuid,
        record_id: String,
        partition_key: String,
    },
}

impl ClientMessage {
    pub fn hello(user_id: &UserId) -> Self {
        Self::Hello {
            user_id: Some(user_id.as_str().to_string()),
        }
    }

    pub fn toggle(request_id: Uuid, key: &RecordKey, field: InteractionField) -> Self {
        Self::Toggle {
            request_id,
            record_id: key.id.clone(),
            partition_key: key.partition_key.clone(),
            field,
        }
    }

    pub fn mark_seen(request_id: Uuid, key: &RecordKey) -> Self {
        Self::MarkSeen {
            request_id,
            record_id: key.id.clone(),
            partition_key: key.partition_key.clone(),
        }
    }

    pub fn fetch(request_id: Uuid, key: &RecordKey) -> Self {
        Self::Fetch {
            request_id,
            record_id: key.id.clone(),
            partition_key: key.partition_key.clone(),
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Welcome {
        connection_id: Uuid,
        user_id: UserId,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    ToggleResult {
        request_id: Uuid,
        record_id: String,
        field: InteractionField,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        active: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        status: u16,
    },
    Snapshot {
        request_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        record: Option<InteractionRecord>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        status: u16,
    },
    InteractionUpdate(ToggleEvent),
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        message: String,
        status: u16,
    },
}

impl ServerMessage {
    pub fn pong() -> Self {
        Self::Pong { timestamp: Utc::now() }
    }

    pub fn toggle_ok(
        request_id: Uuid,
        record_id: impl Into<String>,
        field: InteractionField,
        active: bool,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::ToggleResult {
            request_id,
            record_id: record_id.into(),
            field,
            success: true,
            active: Some(active),
            timestamp: Some(timestamp),
            error: None,
            status: 200,
        }
    }

    pub fn toggle_failed(
        request_id: Uuid,
        record_id: impl Into<String>,
        field: InteractionField,
        error: &ToggleError,
    ) -> Self {
        Self::ToggleResult {
            request_id,
            record_id: record_id.into(),
            field,
            success: false,
            active: None,
            timestamp: None,
            error: Some(error.to_string()),
            status: error.status(),
        }
    }

    pub fn snapshot(request_id: Uuid, result: Result<InteractionRecord, ToggleError>) -> Self {
        match result {
            Ok(record) => Self::Snapshot {
                request_id,
                record: Some(record),
                error: None,
                status: 200,
            },
            Err(e) => Self::Snapshot {
                request_id,
                record: None,
                error: Some(e.to_string()),
                status: e.status(),
            },
        }
    }

    pub fn error(request_id: Option<Uuid>, message: impl Into<String>, status: u16) -> Self {
        Self::Error {
            request_id,
            message: message.into(),
            status,
        }
    }

    /// Correlation id of a reply, if this message answers a request.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Self::ToggleResult { request_id, .. } | Self::Snapshot { request_id, .. } => Some(*request_id),
            Self::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
