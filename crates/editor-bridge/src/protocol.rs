//! Wire structures exchanged with the editor peer.
//!
//! Every frame is a JSON text message. Application traffic is a
//! [`Request`] going out and a [`Response`] coming back, correlated by `id`.
//! Link management uses [`ControlFrame`]s, tagged by a `type` field; they are
//! handled inside the connection and never reach request correlation.

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Version announced in the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Method the peer answers with a trivial result. Used by the CLI `ping` command.
pub const PING_METHOD: &str = "ping";

/// Generate a fresh correlation id (random 128-bit UUID v4).
pub fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// An outbound request. `params` is opaque to the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id; assigned by the client when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl Request {
    /// Create a request without an id.
    pub fn new(method: impl Into<String>, params: serde_json::Value) -> Self {
        Self {
            id: None,
            method: method.into(),
            params,
        }
    }

    /// Use a caller-chosen correlation id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Return the id, generating one first if absent.
    pub fn ensure_id(&mut self) -> &str {
        self.id.get_or_insert_with(new_request_id)
    }
}

/// An inbound response.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    /// Convert into the caller-facing outcome.
    ///
    /// A response carrying neither `result` nor `error` resolves to `null`.
    pub fn into_result(self) -> Result<serde_json::Value, BridgeError> {
        match self.error {
            Some(error) => Err(error.into()),
            None => Ok(self.result.unwrap_or(serde_json::Value::Null)),
        }
    }
}

/// Structured failure reported by the peer.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ResponseError {
    pub message: String,
    #[serde(default = "default_error_kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

fn default_error_kind() -> String {
    "TOOL_EXECUTION".to_string()
}

impl From<ResponseError> for BridgeError {
    fn from(error: ResponseError) -> Self {
        BridgeError::ToolExecution {
            message: error.message,
            kind: error.kind,
            details: error.details,
        }
    }
}

/// Link-management frames, distinguished from responses by their `type` tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// First frame sent by the client on a new socket.
    Handshake {
        #[serde(rename = "clientName")]
        client_name: String,
        #[serde(rename = "protocolVersion")]
        protocol_version: u32,
    },

    /// Peer accepted the handshake.
    HandshakeAck {
        #[serde(
            rename = "serverVersion",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        server_version: Option<String>,
    },

    /// Liveness check.
    Ping,

    /// Liveness acknowledgment.
    Pong,
}

impl ControlFrame {
    /// Try to interpret an inbound JSON value as a control frame.
    ///
    /// Returns `None` for anything without a recognized `type` tag, which
    /// includes every [`Response`].
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value.get("type")?;
        serde_json::from_value(value.clone()).ok()
    }

    pub fn to_text(&self) -> String {
        // Serializing a unit/struct enum with string fields cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
