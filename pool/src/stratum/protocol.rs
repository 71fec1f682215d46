/// Share protocol message types and validation
///
/// JSON text frames over WebSocket:
/// - server -> client: `job`, `accepted`, `rejected`
/// - client -> server: `submit`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CloseReason, ProtocolError};

/// Default upper bound for one client frame.
pub const MAX_MESSAGE_SIZE: usize = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Job {
        job_id: String,
        data: String,
        target: String,
    },
    Accepted,
    Rejected {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        message: Option<String>,
    },
}

impl ServerMessage {
    pub fn rejected() -> Self {
        Self::Rejected { message: None }
    }

    pub fn rejected_with(message: impl Into<String>) -> Self {
        Self::Rejected { message: Some(message.into()) }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// What the writer task should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(ServerMessage),
    Close(CloseReason),
}

/// A validated `submit` request; every field matches `[0-9a-zA-Z]+`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub miner_id: String,
    pub nonce: String,
    pub job_id: String,
    pub path: String,
}

pub fn is_alphanumeric_field(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

fn field(message: &Value, name: &'static str) -> Result<String, ProtocolError> {
    match message.get(name).and_then(Value::as_str) {
        Some(s) if is_alphanumeric_field(s) => Ok(s.to_string()),
        _ => Err(ProtocolError::InvalidField(name)),
    }
}

/// Parse and validate one client text frame.
///
/// `Ok(None)` means a well-formed message of a type the pool ignores.
pub fn parse_client_message(text: &str, max_size: usize) -> Result<Option<SubmitRequest>, ProtocolError> {
    if text.len() > max_size {
        return Err(ProtocolError::TooLarge(text.len()));
    }

    let message: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidJson)?;
    if !message.is_object() {
        return Err(ProtocolError::InvalidJson);
    }

    if message.get("type").and_then(Value::as_str) != Some("submit") {
        return Ok(None);
    }

    Ok(Some(SubmitRequest {
        miner_id: field(&message, "miner_id")?,
        nonce: field(&message, "nonce")?,
        job_id: field(&message, "job_id")?,
        path: field(&message, "path")?,
    }))
}
