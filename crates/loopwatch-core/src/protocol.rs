//! JSON wire protocol spoken over each WebSocket connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{ChangeEvent, ChangeKind, FileType};

/// Messages a client may send.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(rename = "projectIds")]
        project_ids: Vec<String>,
    },
    Unsubscribe {
        #[serde(rename = "projectIds")]
        project_ids: Vec<String>,
    },
    Ping,
}

/// Messages the server sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "file:change")]
    FileChange {
        #[serde(rename = "projectId")]
        project_id: String,
        #[serde(rename = "fileType")]
        file_type: FileType,
        path: String,
        event: ChangeKind,
    },
    #[serde(rename = "subscribed")]
    Subscribed {
        #[serde(rename = "projectIds")]
        project_ids: Vec<String>,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        #[serde(rename = "projectIds")]
        project_ids: Vec<String>,
    },
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "error")]
    Error { message: String },
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message is missing a string \"type\" field")]
    MissingType,
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} message: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

const KNOWN_TYPES: &[&str] = &["subscribe", "unsubscribe", "ping"];

impl ClientMessage {
    /// Parse one text frame.
    ///
    /// Distinguishes bad JSON, a missing or unknown `type`, and a payload
    /// that fails the schema (e.g. `projectIds` not an array of strings) so
    /// the error reply can say which.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?
            .to_string();

        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { kind, source })
    }
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl From<&ChangeEvent> for ServerMessage {
    fn from(event: &ChangeEvent) -> Self {
        ServerMessage::FileChange {
            project_id: event.project_id.clone(),
            file_type: event.file_type,
            path: event.path.clone(),
            event: event.kind,
        }
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        ServerMessage::error(err.to_string())
    }
}
