//! # Error Types
//!
//! Semantic error types for the editor bridge. Every variant carries enough
//! context to diagnose the problem without digging through logs.
//!
//! ## Error Kinds
//!
//! Callers that only need to branch on the broad failure class use
//! [`BridgeError::kind`], which maps every variant onto the taxonomy shared
//! with the domain layer: connection, timeout, tool execution and validation.

use std::fmt;

use thiserror::Error;

/// Convenient Result alias for bridge operations.
pub type BridgeResult<T> = std::result::Result<T, BridgeError>;

/// Broad failure class of a [`BridgeError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No channel, or the channel was lost.
    Connection,

    /// A deadline passed while waiting for a response or a reconnect cycle.
    Timeout,

    /// The peer returned a structured error for a delivered request.
    ToolExecution,

    /// The request or configuration was rejected before anything was sent.
    Validation,
}

impl ErrorKind {
    /// Upper-case wire label, e.g. `"CONNECTION"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "CONNECTION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::ToolExecution => "TOOL_EXECUTION",
            ErrorKind::Validation => "VALIDATION",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All errors that can occur while talking to the editor peer.
#[derive(Error, Debug)]
pub enum BridgeError {
    // ─── Connection ─────────────────────────────────────────────────
    /// Failed to establish a WebSocket connection to the editor.
    #[error("Failed to connect to editor at {url}: {reason}. Is the editor running with the bridge enabled?")]
    ConnectionFailed { url: String, reason: String },

    /// The connection was lost after being established.
    #[error("Connection to editor lost: {reason}")]
    ConnectionLost { reason: String },

    /// The client is not connected and the request was not queued.
    #[error("Not connected to editor")]
    NotConnected,

    /// The command queue is full; the request was dropped.
    #[error("Command queue is full (capacity {capacity}); request dropped")]
    QueueFull { capacity: usize },

    /// The peer did not acknowledge the handshake.
    #[error("Handshake with editor failed: {reason}")]
    Handshake { reason: String },

    /// A state transition outside the allowed set was attempted.
    #[error("Invalid connection state transition {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    // ─── Timeout ────────────────────────────────────────────────────
    /// No response arrived before the request deadline.
    #[error("Request '{method}' timed out after {millis}ms")]
    Timeout { method: String, millis: u64 },

    /// No full disconnect/reconnect cycle was observed in time.
    #[error("No reconnect observed within {millis}ms")]
    ReconnectTimeout { millis: u64 },

    // ─── Tool execution ─────────────────────────────────────────────
    /// The peer ran the request and reported a failure.
    #[error("Editor returned {kind} error: {message}")]
    ToolExecution {
        message: String,
        kind: String,
        details: Option<serde_json::Value>,
    },

    // ─── Protocol ───────────────────────────────────────────────────
    /// Received an unexpected or malformed frame from the editor.
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    // ─── Validation ─────────────────────────────────────────────────
    /// The request was malformed.
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    /// Configuration file error (missing, malformed, or invalid values).
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    // ─── Transport ──────────────────────────────────────────────────
    /// Low-level WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Filesystem or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Map this error onto the shared failure taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::ConnectionFailed { .. }
            | BridgeError::ConnectionLost { .. }
            | BridgeError::NotConnected
            | BridgeError::QueueFull { .. }
            | BridgeError::Handshake { .. }
            | BridgeError::InvalidTransition { .. }
            | BridgeError::Protocol { .. }
            | BridgeError::WebSocket(_)
            | BridgeError::Io(_) => ErrorKind::Connection,
            BridgeError::Timeout { .. } | BridgeError::ReconnectTimeout { .. } => {
                ErrorKind::Timeout
            }
            BridgeError::ToolExecution { .. } => ErrorKind::ToolExecution,
            BridgeError::Validation { .. } | BridgeError::Config { .. } | BridgeError::Json(_) => {
                ErrorKind::Validation
            }
        }
    }

    /// Returns `true` if this error is transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionLost { .. }
                | BridgeError::Timeout { .. }
                | BridgeError::NotConnected
                | BridgeError::WebSocket(_)
        )
    }

    /// Returns `true` if this error indicates the connection is dead
    /// and a reconnect is needed.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BridgeError::ConnectionFailed { .. }
                | BridgeError::ConnectionLost { .. }
                | BridgeError::NotConnected
                | BridgeError::Handshake { .. }
                | BridgeError::WebSocket(_)
        )
    }
}

// ─── From impls for external error types ────────────────────────────────

impl From<tokio_tungstenite::tungstenite::Error> for BridgeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        BridgeError::WebSocket(err.to_string())
    }
}

#[cfg(feature = "config-toml")]
impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::Config {
            reason: err.to_string(),
        }
    }
}
