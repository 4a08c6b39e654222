//! # Configuration
//!
//! [`BridgeConfig`] holds everything needed to reach the editor peer.
//!
//! ## Loading Priority
//!
//! Configuration is loaded from the first source that provides a value:
//!
//! 1. Explicit struct fields (programmatic construction)
//! 2. TOML config file at an explicit path
//! 3. File named by the `EDITOR_BRIDGE_CONFIG` environment variable
//! 4. `./editor-bridge.toml` in the current directory
//! 5. `~/.config/editor-bridge/editor-bridge.toml`
//!
//! Individual fields can always be overridden by environment variables
//! (`EDITOR_BRIDGE_HOST`, `EDITOR_BRIDGE_PORT`, `EDITOR_BRIDGE_CLIENT_NAME`,
//! `EDITOR_BRIDGE_REQUEST_TIMEOUT_MS`), even when loading from a file.
//!
//! All durations are stored in milliseconds so that tests can run with
//! sub-second timings.

#[cfg(feature = "config-toml")]
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, BridgeResult};

/// Default editor host. The bridge listens on loopback only.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Default editor bridge port.
pub const DEFAULT_PORT: u16 = 6400;

/// Config file name searched for by [`BridgeConfig::discover`].
pub const CONFIG_FILE_NAME: &str = "editor-bridge.toml";

const DEFAULT_PATH: &str = "/";
const DEFAULT_CLIENT_NAME: &str = "editor-bridge";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_QUEUE_CAPACITY: usize = 100;
const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 15_000;
const DEFAULT_HEARTBEAT_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_FORCE_COOLDOWN_MS: u64 = 2_000;

#[cfg(feature = "config-toml")]
const ENV_CONFIG: &str = "EDITOR_BRIDGE_CONFIG";
const ENV_HOST: &str = "EDITOR_BRIDGE_HOST";
const ENV_PORT: &str = "EDITOR_BRIDGE_PORT";
const ENV_CLIENT_NAME: &str = "EDITOR_BRIDGE_CLIENT_NAME";
const ENV_REQUEST_TIMEOUT: &str = "EDITOR_BRIDGE_REQUEST_TIMEOUT_MS";

/// Configuration for the editor bridge transport.
///
/// # Examples
///
/// ```
/// use editor_bridge::config::BridgeConfig;
///
/// let mut config = BridgeConfig::new();
/// config.port = 7400;
/// assert_eq!(config.url(), "ws://127.0.0.1:7400/");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Host the editor bridge listens on.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the editor bridge listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// WebSocket path on the editor side.
    #[serde(default = "default_path")]
    pub path: String,

    /// Name sent to the editor in the handshake.
    #[serde(default = "default_client_name")]
    pub client_name: String,

    /// Default deadline for a single request, in milliseconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Deadline for opening the socket and completing the handshake, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Command queue settings.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Heartbeat (liveness check) settings.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Automatic reconnection settings.
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Buffering of requests issued while the editor is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue requests by default while not connected.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of queued requests.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,
}

/// Periodic liveness check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Enable the heartbeat.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval between pings, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// How long to wait for a pong before declaring the link dead, in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Auto-reconnect behavior when the socket drops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable auto-reconnect on liveness loss.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of reconnect attempts. 0 means unlimited.
    #[serde(default = "default_reconnect_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_reconnect_base_delay")]
    pub base_delay_ms: u64,

    /// Exponential backoff cap, in milliseconds.
    #[serde(default = "default_reconnect_max_delay")]
    pub max_delay_ms: u64,

    /// Minimum spacing between timeout-triggered forced reconnects, in milliseconds.
    #[serde(default = "default_force_cooldown")]
    pub force_cooldown_ms: u64,
}

// ─── Defaults ───────────────────────────────────────────────────────────

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_client_name() -> String {
    DEFAULT_CLIENT_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_heartbeat_timeout() -> u64 {
    DEFAULT_HEARTBEAT_TIMEOUT_MS
}

fn default_reconnect_max_attempts() -> u32 {
    DEFAULT_RECONNECT_MAX_ATTEMPTS
}

fn default_reconnect_base_delay() -> u64 {
    DEFAULT_RECONNECT_BASE_DELAY_MS
}

fn default_reconnect_max_delay() -> u64 {
    DEFAULT_RECONNECT_MAX_DELAY_MS
}

fn default_force_cooldown() -> u64 {
    DEFAULT_FORCE_COOLDOWN_MS
}

// ─── Default impls ──────────────────────────────────────────────────────

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            timeout_ms: DEFAULT_HEARTBEAT_TIMEOUT_MS,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_RECONNECT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RECONNECT_MAX_DELAY_MS,
            force_cooldown_ms: DEFAULT_FORCE_COOLDOWN_MS,
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatConfig {
    /// Interval between pings.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Pong deadline.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ReconnectConfig {
    /// Minimum spacing between timeout-triggered forced reconnects.
    pub fn force_cooldown(&self) -> Duration {
        Duration::from_millis(self.force_cooldown_ms)
    }
}

// ─── BridgeConfig impl ──────────────────────────────────────────────────

impl BridgeConfig {
    /// Create a config with every field at its default.
    pub fn new() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            path: default_path(),
            client_name: default_client_name(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            queue: QueueConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }

    /// WebSocket URL of the editor bridge.
    pub fn url(&self) -> String {
        let path = if self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("ws://[{}]:{}{}", self.host, self.port, path)
        } else {
            format!("ws://{}:{}{}", self.host, self.port, path)
        }
    }

    /// Default request deadline.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Socket + handshake deadline.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Load config from defaults plus environment variable overrides.
    ///
    /// # Errors
    /// Returns [`BridgeError::Config`] if an override has an unparsable value.
    pub fn from_env() -> BridgeResult<Self> {
        let mut config = Self::new();
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load config from a TOML file, with environment variable overrides.
    ///
    /// # Errors
    /// Returns [`BridgeError::Config`] when the file is unreadable, is not
    /// valid TOML, or an override has an unparsable value.
    #[cfg(feature = "config-toml")]
    pub fn from_file(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| BridgeError::Config {
            reason: format!("Failed to read config file '{}': {}", path.display(), e),
        })?;
        let mut config: Self = toml::from_str(&contents)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Discover and load config from the standard search path:
    ///
    /// 1. Explicit path (if `Some`)
    /// 2. `EDITOR_BRIDGE_CONFIG` environment variable
    /// 3. `./editor-bridge.toml`
    /// 4. `~/.config/editor-bridge/editor-bridge.toml`
    ///
    /// Falls back to environment-variable-only config if no file is found.
    ///
    /// # Errors
    /// Returns any error from [`from_file`](Self::from_file) or
    /// [`from_env`](Self::from_env).
    #[cfg(feature = "config-toml")]
    pub fn discover(explicit_path: Option<&Path>) -> BridgeResult<Self> {
        if let Some(path) = explicit_path {
            return Self::from_file(path);
        }

        if let Ok(path) = std::env::var(ENV_CONFIG) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Self::from_file(&local_path);
        }

        if let Some(user_path) = user_config_path() {
            if user_path.exists() {
                return Self::from_file(&user_path);
            }
        }

        Self::from_env()
    }

    /// Apply overrides from a variable lookup (normally the process environment).
    ///
    /// # Errors
    /// Returns [`BridgeError::Config`] if a numeric override does not parse.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> BridgeResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(ENV_HOST) {
            self.host = host;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.port = port.trim().parse().map_err(|_| BridgeError::Config {
                reason: format!("{ENV_PORT} must be a port number, got '{port}'"),
            })?;
        }
        if let Some(name) = lookup(ENV_CLIENT_NAME) {
            self.client_name = name;
        }
        if let Some(timeout) = lookup(ENV_REQUEST_TIMEOUT) {
            self.request_timeout_ms =
                timeout.trim().parse().map_err(|_| BridgeError::Config {
                    reason: format!("{ENV_REQUEST_TIMEOUT} must be milliseconds, got '{timeout}'"),
                })?;
        }
        Ok(())
    }

    /// Check the values for combinations the transport cannot honor.
    ///
    /// # Errors
    /// Returns [`BridgeError::Config`] describing the first invalid value.
    pub fn validate(&self) -> BridgeResult<()> {
        if self.host.trim().is_empty() {
            return Err(config_error("host must not be empty"));
        }
        if self.request_timeout_ms == 0 {
            return Err(config_error("request_timeout_ms must be greater than zero"));
        }
        if self.connect_timeout_ms == 0 {
            return Err(config_error("connect_timeout_ms must be greater than zero"));
        }
        if self.queue.enabled && self.queue.capacity == 0 {
            return Err(config_error(
                "queue.capacity must be greater than zero when the queue is enabled",
            ));
        }
        if self.heartbeat.enabled && (self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms == 0)
        {
            return Err(config_error(
                "heartbeat.interval_ms and heartbeat.timeout_ms must be greater than zero",
            ));
        }
        if self.reconnect.base_delay_ms > self.reconnect.max_delay_ms {
            return Err(config_error(
                "reconnect.base_delay_ms must not exceed reconnect.max_delay_ms",
            ));
        }
        Ok(())
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────

fn config_error(reason: &str) -> BridgeError {
    BridgeError::Config {
        reason: reason.to_string(),
    }
}

/// Platform-appropriate per-user config path.
#[cfg(feature = "config-toml")]
fn user_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("APPDATA")
            .ok()
            .map(|dir| PathBuf::from(dir).join("editor-bridge").join(CONFIG_FILE_NAME))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME").ok().map(|dir| {
            PathBuf::from(dir)
                .join(".config")
                .join("editor-bridge")
                .join(CONFIG_FILE_NAME)
        })
    }
}
