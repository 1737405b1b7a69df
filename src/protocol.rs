//! Control-link message envelopes
//!
//! Commands arrive as `{"cmd": "...", "params": {...}}`. Every completed
//! command produces one response `{"type": "response", "cmd": ..., "status":
//! ..., "data"|"error": ...}`. Large item lists are streamed as a `chunked`
//! announcement, one `chunk` message per item and a final response.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use thiserror::Error;

use crate::Result;

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Success,
    Error,
    Busy,
    InvalidCommand,
    Timeout,
    Chunked,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Busy => "busy",
            Self::InvalidCommand => "invalid_command",
            Self::Timeout => "timeout",
            Self::Chunked => "chunked",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Response,
    Chunk,
    /// Asynchronous activity notification
    Status,
}

/// Reasons a command could not be decoded
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid JSON")]
    InvalidJson(String),

    #[error("Command must be a JSON object")]
    NotAnObject,

    #[error("Missing command")]
    MissingCommand,
}

/// Decoded command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandEnvelope {
    pub command: String,
    pub params: Value,
}

impl CommandEnvelope {
    /// Decode a command. `command` is accepted in place of `cmd`; missing
    /// or null params become an empty object.
    pub fn decode(bytes: &[u8]) -> std::result::Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;
        let mut object = match value {
            Value::Object(object) => object,
            _ => return Err(DecodeError::NotAnObject),
        };

        let command = object
            .get("cmd")
            .or_else(|| object.get("command"))
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .ok_or(DecodeError::MissingCommand)?;

        let params = match object.remove("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(params) => params,
        };

        Ok(Self { command, params })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&json!({
            "cmd": self.command,
            "params": self.params,
        }))?)
    }
}

/// Response or status notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(rename = "cmd")]
    pub command: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    fn response(command: &str, status: Status) -> Self {
        Self {
            kind: MessageKind::Response,
            command: command.to_string(),
            status,
            data: None,
            error: None,
        }
    }

    pub fn success(command: &str, data: Value) -> Self {
        Self {
            data: Some(data),
            ..Self::response(command, Status::Success)
        }
    }

    pub fn ok(command: &str) -> Self {
        Self::response(command, Status::Success)
    }

    pub fn error(command: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::response(command, Status::Error)
        }
    }

    pub fn busy(command: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::response(command, Status::Busy)
        }
    }

    pub fn invalid_command(command: &str) -> Self {
        Self {
            error: Some("Unknown command".to_string()),
            ..Self::response(command, Status::InvalidCommand)
        }
    }

    pub fn timeout(command: &str, message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::response(command, Status::Timeout)
        }
    }

    /// Announcement preceding `total` chunk messages
    pub fn chunked(command: &str, total: usize) -> Self {
        Self {
            data: Some(json!({ "total": total })),
            ..Self::response(command, Status::Chunked)
        }
    }

    /// Activity notification sent on the status channel
    pub fn notification(command: &str, status: Status, data: Value) -> Self {
        Self {
            kind: MessageKind::Status,
            data: Some(data),
            ..Self::response(command, status)
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// One item of a streamed list
pub fn chunk_message(command: &str, index: usize, total: usize, item_key: &str, item: Value) -> Value {
    let mut object = Map::new();
    object.insert("type".to_string(), json!("chunk"));
    object.insert("cmd".to_string(), json!(command));
    object.insert("chunkIndex".to_string(), json!(index));
    object.insert("totalChunks".to_string(), json!(total));
    object.insert(item_key.to_string(), item);
    Value::Object(object)
}

/// Destination of an outbound message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Command response or chunk
    Reply(Vec<u8>),
    /// Status-channel notification
    Notify(Vec<u8>),
}

impl OutboundMessage {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Reply(bytes) | Self::Notify(bytes) => bytes,
        }
    }
}

/// A list result that may be streamed
#[derive(Debug, Clone, PartialEq)]
pub struct ItemStream {
    /// Key of the list in the single-message form, e.g. `networks`
    pub list_key: &'static str,
    /// Key of each item in chunk messages, e.g. `network`
    pub item_key: &'static str,
    pub items: Vec<Value>,
    /// Extra fields of the final response
    pub summary: Map<String, Value>,
}

impl ItemStream {
    /// Encode as a single response, or as a chunked sequence when that
    /// response would exceed `ceiling` bytes.
    pub fn encode(&self, command: &str, ceiling: usize) -> Result<Vec<Vec<u8>>> {
        let mut data = self.summary.clone();
        data.insert(self.list_key.to_string(), Value::Array(self.items.clone()));
        data.insert("count".to_string(), json!(self.items.len()));
        let single = ResponseEnvelope::success(command, Value::Object(data)).encode()?;
        if single.len() <= ceiling {
            return Ok(vec![single]);
        }

        let total = self.items.len();
        let mut out = Vec::with_capacity(total + 2);
        out.push(ResponseEnvelope::chunked(command, total).encode()?);
        for (index, item) in self.items.iter().enumerate() {
            let message = chunk_message(command, index, total, self.item_key, item.clone());
            out.push(serde_json::to_vec(&message)?);
        }

        let mut summary = self.summary.clone();
        summary.insert("count".to_string(), json!(total));
        out.push(ResponseEnvelope::success(command, Value::Object(summary)).encode()?);
        Ok(out)
    }
}
