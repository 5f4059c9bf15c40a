//! SignalR JSON hub protocol
//!
//! Every message is a JSON object terminated by the ASCII record separator
//! (`0x1E`). A single transport frame may carry several records. The first
//! exchange on a new connection is the handshake: the client announces the
//! protocol and the server answers with `{}` or `{"error": "..."}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HubError, Result};

/// Terminator appended to every protocol record
pub const RECORD_SEPARATOR: char = '\u{1e}';

const INVOCATION: u64 = 1;
const COMPLETION: u64 = 3;
const PING: u64 = 6;
const CLOSE: u64 = 7;

/// Handshake request sent right after the transport opens
#[derive(Debug, Clone, Serialize)]
pub struct HandshakeRequest {
    pub protocol: &'static str,
    pub version: u32,
}

impl HandshakeRequest {
    pub fn json() -> Self {
        Self {
            protocol: "json",
            version: 1,
        }
    }

    pub fn to_record(&self) -> Result<String> {
        Ok(format!("{}{}", serde_json::to_string(self)?, RECORD_SEPARATOR))
    }
}

/// Handshake response from the server
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeResponse {
    #[serde(default)]
    pub error: Option<String>,
}

/// Parse the handshake response at the start of `frame`
///
/// Returns the response and whatever follows it in the same frame; servers are
/// allowed to batch the first hub messages with the handshake reply.
pub fn parse_handshake(frame: &str) -> Result<(HandshakeResponse, &str)> {
    let Some(end) = frame.find(RECORD_SEPARATOR) else {
        return Err(HubError::Handshake(format!(
            "Incomplete handshake response: {}",
            frame
        )));
    };
    let response: HandshakeResponse = serde_json::from_str(&frame[..end]).map_err(|e| {
        HubError::Handshake(format!("Malformed handshake response: {}", e))
    })?;
    Ok((response, &frame[end + RECORD_SEPARATOR.len_utf8()..]))
}

/// Server or client invocation of a named hub method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub target: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

/// Result of a client-initiated invocation that carried an id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Completion {
    pub invocation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Connection close requested by the other side
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_reconnect: Option<bool>,
}

impl CloseMessage {
    /// A close without `allowReconnect: true` ends the session for good
    pub fn allows_reconnect(&self) -> bool {
        self.allow_reconnect.unwrap_or(false)
    }
}

/// A single hub protocol message
#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(Invocation),
    Completion(Completion),
    Ping,
    Close(CloseMessage),
    /// Stream items, stream invocations, cancellations: not used by this client
    Other(u64),
}

impl HubMessage {
    /// Fire-and-forget invocation (no invocation id, so no completion is sent back)
    pub fn send(target: impl Into<String>, arguments: Vec<Value>) -> Self {
        HubMessage::Invocation(Invocation {
            invocation_id: None,
            target: target.into(),
            arguments,
        })
    }

    /// Parse one record (without its separator)
    pub fn parse(record: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(record)?;
        let message_type = value
            .get("type")
            .and_then(Value::as_u64)
            .ok_or_else(|| HubError::InvalidEvent(format!("Missing message type: {}", record)))?;

        let message = match message_type {
            INVOCATION => HubMessage::Invocation(serde_json::from_value(value)?),
            COMPLETION => HubMessage::Completion(serde_json::from_value(value)?),
            PING => HubMessage::Ping,
            CLOSE => HubMessage::Close(serde_json::from_value(value)?),
            other => HubMessage::Other(other),
        };
        Ok(message)
    }

    /// Encode as a record, separator included
    pub fn to_record(&self) -> Result<String> {
        let (message_type, mut body) = match self {
            HubMessage::Invocation(invocation) => (INVOCATION, serde_json::to_value(invocation)?),
            HubMessage::Completion(completion) => (COMPLETION, serde_json::to_value(completion)?),
            HubMessage::Ping => (PING, Value::Object(Default::default())),
            HubMessage::Close(close) => (CLOSE, serde_json::to_value(close)?),
            HubMessage::Other(other) => {
                return Err(HubError::InvalidState(format!(
                    "Cannot encode hub message type {}",
                    other
                )))
            }
        };
        if let Value::Object(map) = &mut body {
            map.insert("type".to_string(), Value::from(message_type));
        }
        Ok(format!("{}{}", serde_json::to_string(&body)?, RECORD_SEPARATOR))
    }
}

/// Split a frame into records and parse each one
///
/// Malformed records are returned as errors in place so one bad record does not
/// hide the rest of the frame.
pub fn parse_frame(frame: &str) -> Vec<Result<HubMessage>> {
    frame
        .split(RECORD_SEPARATOR)
        .map(str::trim)
        .filter(|record| !record.is_empty())
        .map(HubMessage::parse)
        .collect()
}
