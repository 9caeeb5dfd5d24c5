//! Wire frames exchanged with the agent. Client ↔ server JSON, one frame per
//! text message, discriminated by the `type` field.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Client → server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Start (or restart) an agent turn.
    SendRequest {
        id: String,
        payload: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        trigger: Option<String>,
    },
    /// Stop producing chunks for `id`.
    Cancel { id: String },
    /// "Do I have an active stream?"
    ResumeRequest,
    /// Ready to receive the resumed stream for `id`.
    ResumeAck { id: String },
}

impl ClientFrame {
    pub fn send_request(id: &str, payload: &str, trigger: Option<&str>) -> Self {
        Self::SendRequest {
            id: id.to_string(),
            payload: payload.to_string(),
            trigger: trigger.map(str::to_string),
        }
    }

    pub fn cancel(id: &str) -> Self {
        Self::Cancel { id: id.to_string() }
    }

    pub fn resume_ack(id: &str) -> Self {
        Self::ResumeAck { id: id.to_string() }
    }

    /// Tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SendRequest { .. } => "send_request",
            Self::Cancel { .. } => "cancel",
            Self::ResumeRequest => "resume_request",
            Self::ResumeAck { .. } => "resume_ack",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }
}

/// Server → client: one incremental piece of a response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResponseChunkFrame {
    pub id: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<bool>,
    #[serde(default)]
    pub replay: Option<bool>,
}

impl ResponseChunkFrame {
    /// When set, `body` is an error message rather than payload.
    pub fn is_error(&self) -> bool {
        self.error.unwrap_or(false)
    }

    pub fn is_replay(&self) -> bool {
        self.replay.unwrap_or(false)
    }
}

/// Server → client frames.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    ResponseChunk(ResponseChunkFrame),
    /// Announces an active stream for `id`, unsolicited on connect or in
    /// answer to a resume request.
    StreamResuming { id: String },
}

impl ServerFrame {
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}
