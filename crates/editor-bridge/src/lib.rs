//! # editor-bridge
//!
//! Reliable request/response transport between a command-line tool and an
//! editor-hosted agent over a local WebSocket.
//!
//! The editor side routinely drops the socket on purpose (a script reload
//! tears down its listener for several seconds), so this crate treats
//! disconnection as a normal event: it tracks the link with an explicit
//! state machine, detects silent failures with a heartbeat, reconnects with
//! backoff, and buffers requests issued during an outage so they can be
//! replayed in order once the editor is back.
//!
//! ## Quick Start
//!
//! ```ignore
//! use editor_bridge::{BridgeClient, BridgeConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> editor_bridge::BridgeResult<()> {
//!     // Load config from editor-bridge.toml or the environment
//!     let config = BridgeConfig::discover(None)?;
//!
//!     let client = BridgeClient::new(config);
//!     client.start("my-tool").await?;
//!
//!     let result = client.call("read_console", json!({"count": 20})).await?;
//!     println!("{result}");
//!
//!     client.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Layers
//!
//! | Layer | Type | Owns | Best for |
//! |-------|------|------|----------|
//! | Link | [`Connection`](connection::Connection) | socket, state machine, heartbeat, reconnect loop | custom protocols |
//! | Requests | [`BridgeClient`] | pending table, timeouts, command queue, replay | applications |
//!
//! ## Configuration
//!
//! See [`BridgeConfig`] for the full reference. The simplest setup is an
//! `editor-bridge.toml` file:
//!
//! ```toml
//! host = "127.0.0.1"
//! port = 6400
//! request_timeout_ms = 30000
//!
//! [reconnect]
//! max_attempts = 10
//! ```

pub mod backoff;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod heartbeat;
pub mod protocol;
pub mod queue;
pub mod state;

// ─── Public re-exports ──────────────────────────────────────────────────

pub use client::{BridgeClient, RequestOptions};
pub use config::BridgeConfig;
pub use connection::MAX_RECONNECT_REASON;
pub use error::{BridgeError, BridgeResult, ErrorKind};
pub use protocol::{Request, Response};
pub use queue::QueueStats;
pub use state::{ConnectionState, ConnectionStateChange, Subscription};
