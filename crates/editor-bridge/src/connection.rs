//! # Editor Connection
//!
//! Owns the WebSocket to the editor and drives the [`ConnectionState`]
//! machine. Everything above this layer sees the link only through
//! [`Connection::send`], the [`ConnectionEvent`] stream and state
//! notifications.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       Connection                          │
//! │                                                           │
//! │  core: state + current Link + attempt token               │
//! │                                                           │
//! │  Link (one per socket):                                   │
//! │    send() ─► outbound mpsc ─► writer task ─► SplitSink     │
//! │    SplitStream ─► reader task ─┬─► pong   → heartbeat      │
//! │                                ├─► ping   → pong reply     │
//! │                                └─► other  → Message event  │
//! │    HeartbeatMonitor ─► Unhealthy ─► link lost              │
//! │                                                           │
//! │  link lost ─► Reconnecting ─► reconnect task (backoff) ─┐  │
//! │                  ▲                                      │  │
//! │                  └──── Connected / Disconnected ◄───────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Ordering
//!
//! Transitions are numbered and appended to an outbox while the core lock
//! is held. Whichever thread applied a transition then drains the outbox
//! with no lock held, one delivery round at a time, so listeners and the
//! event channel see transitions in the order they were applied. A listener
//! may call [`Connection::disconnect`] or start a reconnect; its transition
//! is delivered after the one being delivered.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::backoff::Backoff;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatStatus};
use crate::protocol::{ControlFrame, PROTOCOL_VERSION};
use crate::state::{ConnectionState, ConnectionStateChange, StateListeners, Subscription};

/// Reason attached to the `Reconnecting -> Disconnected` transition when the
/// reconnect budget is spent. The client clears its command queue only on
/// this reason.
pub const MAX_RECONNECT_REASON: &str = "max reconnection attempts reached";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

/// Everything the connection reports upward.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A state transition, in the order it happened.
    StateChange(ConnectionStateChange),

    /// An inbound application frame (anything that is not a control frame).
    Message(String),

    /// A non-fatal problem on the link, e.g. a frame that is not JSON.
    Error(BridgeError),
}

// ─── Link ───────────────────────────────────────────────────────────────

/// Tasks and writer queue of one live socket.
struct Link {
    id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl Link {
    /// Send a close frame and let the writer flush it. The reader stops now.
    fn close(mut self, reason: &str) {
        let frame = CloseFrame {
            code: CloseCode::Normal,
            reason: reason.to_string().into(),
        };
        if self.outbound.send(Message::Close(Some(frame))).is_ok() {
            self.writer.take();
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

// ─── Shared state ───────────────────────────────────────────────────────

struct Core {
    state: ConnectionState,
    link: Option<Link>,
    /// Bumped whenever a connect or reconnect sequence starts or is
    /// cancelled. In-flight attempts compare against it before installing
    /// a socket.
    attempt: u64,
    reconnect_task: Option<JoinHandle<()>>,
    last_failure: Option<String>,
    /// Number of the last applied transition.
    seq: u64,
}

impl Core {
    fn transition(
        &mut self,
        next: ConnectionState,
        reason: Option<String>,
    ) -> Option<ConnectionStateChange> {
        match self.state.transition(next, reason) {
            Ok(change) => {
                self.state = next;
                self.seq += 1;
                Some(change)
            }
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring invalid state transition");
                None
            }
        }
    }
}

struct Shared {
    config: BridgeConfig,
    url: String,
    client_name: Mutex<String>,
    core: Mutex<Core>,
    outbox: Mutex<VecDeque<(u64, ConnectionStateChange)>>,
    delivering: AtomicBool,
    listeners: StateListeners,
    state_tx: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    next_link_id: AtomicU64,
}

impl Shared {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn client_name(&self) -> String {
        self.client_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn outbox(&self) -> MutexGuard<'_, VecDeque<(u64, ConnectionStateChange)>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the core, record the transition it returns, then
    /// deliver pending transitions.
    fn update<R>(&self, f: impl FnOnce(&mut Core) -> (Option<ConnectionStateChange>, R)) -> R {
        let out = {
            let mut core = self.core();
            let (change, out) = f(&mut core);
            if let Some(change) = change {
                tracing::info!(
                    previous = %change.previous,
                    current = %change.current,
                    reason = change.reason.as_deref().unwrap_or(""),
                    "Connection state changed"
                );
                self.state_tx.send_replace(change.current);
                self.outbox().push_back((core.seq, change));
            }
            out
        };
        self.deliver();
        out
    }

    /// Hand queued transitions to listeners and the event channel. Only one
    /// thread delivers at a time; a call made while another round is running
    /// (including from inside a listener) leaves its transitions to that
    /// round.
    fn deliver(&self) {
        loop {
            if self.delivering.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = self.outbox().pop_front();
                let Some((seq, change)) = next else {
                    break;
                };
                self.listeners.notify(seq, &change);
                let _ = self.events.send(ConnectionEvent::StateChange(change));
            }
            self.delivering.store(false, Ordering::Release);
            if self.outbox().is_empty() {
                return;
            }
        }
    }

    fn emit_error(&self, error: BridgeError) {
        tracing::warn!(error = %error, "Editor link error");
        let _ = self.events.send(ConnectionEvent::Error(error));
    }

    fn connect_failure(&self, reason: Option<String>) -> BridgeError {
        BridgeError::ConnectionFailed {
            url: self.url.clone(),
            reason: reason.unwrap_or_else(|| "connection attempt failed".into()),
        }
    }

    /// Open the socket and complete the handshake, bounded by the connect
    /// timeout.
    async fn establish(&self) -> BridgeResult<WsStream> {
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::ConnectionFailed {
                url: self.url.clone(),
                reason: format!("timed out after {}ms", self.config.connect_timeout_ms),
            }),
        }
    }

    async fn handshake(&self) -> BridgeResult<WsStream> {
        let (mut ws, _response) =
            connect_async(self.url.as_str())
                .await
                .map_err(|e| BridgeError::ConnectionFailed {
                    url: self.url.clone(),
                    reason: e.to_string(),
                })?;

        let hello = ControlFrame::Handshake {
            client_name: self.client_name(),
            protocol_version: PROTOCOL_VERSION,
        };
        ws.send(Message::text(hello.to_text())).await?;

        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    let value: serde_json::Value =
                        serde_json::from_str(text.as_str()).map_err(|e| BridgeError::Handshake {
                            reason: format!("malformed reply: {e}"),
                        })?;
                    return match ControlFrame::from_value(&value) {
                        Some(ControlFrame::HandshakeAck { server_version }) => {
                            tracing::info!(
                                url = %self.url,
                                server_version = server_version.as_deref().unwrap_or("unknown"),
                                "Handshake with editor complete"
                            );
                            Ok(ws)
                        }
                        _ => Err(BridgeError::Handshake {
                            reason: format!("unexpected reply: {}", text.as_str()),
                        }),
                    };
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(BridgeError::Handshake {
                        reason: "socket closed before acknowledgment".into(),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Split a handshaken socket and start its reader, writer and heartbeat.
    fn spawn_link(self: &Arc<Self>, ws: WsStream) -> Link {
        let id = self.next_link_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (writer, reader) = ws.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (pong_tx, pong_rx) = watch::channel(0u64);

        let heartbeat = self
            .config
            .heartbeat
            .enabled
            .then(|| HeartbeatMonitor::start(&self.config.heartbeat, outbound.clone(), pong_rx));

        let writer = tokio::spawn(write_loop(Arc::clone(self), id, writer, outbound_rx));
        let reader = tokio::spawn(read_loop(
            Arc::clone(self),
            id,
            reader,
            outbound.clone(),
            pong_tx,
            heartbeat,
        ));

        Link {
            id,
            outbound,
            reader,
            writer: Some(writer),
        }
    }

    /// Classify one inbound text frame.
    fn handle_text(
        &self,
        text: &str,
        outbound: &mpsc::UnboundedSender<Message>,
        pongs: &watch::Sender<u64>,
    ) {
        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                self.emit_error(BridgeError::Protocol {
                    reason: format!("malformed frame from editor: {e}"),
                });
                return;
            }
        };

        match ControlFrame::from_value(&value) {
            Some(ControlFrame::Pong) => pongs.send_modify(|seen| *seen += 1),
            Some(ControlFrame::Ping) => {
                let _ = outbound.send(Message::text(ControlFrame::Pong.to_text()));
            }
            Some(other) => tracing::debug!(frame = ?other, "Ignoring control frame"),
            None => {
                let _ = self.events.send(ConnectionEvent::Message(text.to_string()));
            }
        }
    }

    /// Complete a first connect started by [`Connection::connect`].
    async fn first_connect(self: Arc<Self>, token: u64) -> BridgeResult<()> {
        tracing::info!(url = %self.url, "Connecting to editor");

        match self.establish().await {
            Ok(ws) => {
                let installed = self.update(|core| {
                    if core.attempt != token || core.state != ConnectionState::Connecting {
                        return (None, false);
                    }
                    core.link = Some(self.spawn_link(ws));
                    core.last_failure = None;
                    (core.transition(ConnectionState::Connected, None), true)
                });
                if installed {
                    Ok(())
                } else {
                    Err(self.connect_failure(Some(
                        "connection attempt was cancelled".to_string(),
                    )))
                }
            }
            Err(e) => {
                let reason = e.to_string();
                self.update(|core| {
                    if core.attempt != token || core.state != ConnectionState::Connecting {
                        return (None, ());
                    }
                    core.last_failure = Some(reason.clone());
                    (
                        core.transition(ConnectionState::Disconnected, Some(reason)),
                        (),
                    )
                });
                Err(e)
            }
        }
    }

    /// Move `Connected -> Reconnecting` and start the reconnect task.
    fn begin_reconnect(
        self: &Arc<Self>,
        core: &mut Core,
        reason: String,
    ) -> Option<ConnectionStateChange> {
        if let Some(link) = core.link.take() {
            link.close(&reason);
        }
        let change = core.transition(ConnectionState::Reconnecting, Some(reason))?;
        core.attempt += 1;
        core.reconnect_task = Some(tokio::spawn(
            Arc::clone(self).reconnect_loop(core.attempt),
        ));
        Some(change)
    }

    /// Called by a link's tasks when its socket died.
    fn link_lost(self: &Arc<Self>, link_id: u64, reason: String) {
        self.update(|core| {
            let current = core.link.as_ref().map(|link| link.id);
            if current != Some(link_id) || core.state != ConnectionState::Connected {
                return (None, ());
            }
            tracing::warn!(reason = %reason, "Lost connection to editor");

            if self.config.reconnect.enabled {
                (self.begin_reconnect(core, reason), ())
            } else {
                core.link = None;
                core.last_failure = Some(reason.clone());
                (
                    core.transition(ConnectionState::Disconnected, Some(reason)),
                    (),
                )
            }
        });
    }

    async fn reconnect_loop(self: Arc<Self>, token: u64) {
        let mut backoff = Backoff::from_config(&self.config.reconnect);

        while let Some(delay) = backoff.next_delay() {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            {
                let core = self.core();
                if core.attempt != token || core.state != ConnectionState::Reconnecting {
                    return;
                }
            }

            let attempt = backoff.attempt();
            tracing::info!(
                attempt,
                max_attempts = backoff.max_attempts(),
                "Attempting to reconnect to editor"
            );

            match self.establish().await {
                Ok(ws) => {
                    self.update(|core| {
                        if core.attempt != token || core.state != ConnectionState::Reconnecting {
                            return (None, ());
                        }
                        core.link = Some(self.spawn_link(ws));
                        core.reconnect_task = None;
                        core.last_failure = None;
                        let reason = format!("reconnected after {attempt} attempt(s)");
                        (core.transition(ConnectionState::Connected, Some(reason)), ())
                    });
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "Reconnection attempt failed");
                    self.core().last_failure = Some(e.to_string());
                }
            }
        }

        self.update(|core| {
            if core.attempt != token || core.state != ConnectionState::Reconnecting {
                return (None, ());
            }
            tracing::error!(
                attempts = backoff.attempt(),
                "Giving up on reconnecting to editor"
            );
            core.reconnect_task = None;
            core.last_failure = Some(MAX_RECONNECT_REASON.to_string());
            (
                core.transition(
                    ConnectionState::Disconnected,
                    Some(MAX_RECONNECT_REASON.to_string()),
                ),
                (),
            )
        });
    }
}

// ─── Link tasks ─────────────────────────────────────────────────────────

async fn write_loop(
    shared: Arc<Shared>,
    link_id: u64,
    mut writer: WsWriter,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = writer.send(message).await {
            shared.link_lost(link_id, format!("write failed: {e}"));
            return;
        }
        if closing {
            break;
        }
    }
    let _ = writer.close().await;
    tracing::debug!(link_id, "Writer loop exiting");
}

async fn next_status(
    statuses: &mut Option<mpsc::Receiver<HeartbeatStatus>>,
) -> Option<HeartbeatStatus> {
    match statuses {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

enum Step {
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
    Heartbeat(Option<HeartbeatStatus>),
}

async fn read_loop(
    shared: Arc<Shared>,
    link_id: u64,
    mut reader: WsReader,
    outbound: mpsc::UnboundedSender<Message>,
    pongs: watch::Sender<u64>,
    heartbeat: Option<(HeartbeatMonitor, mpsc::Receiver<HeartbeatStatus>)>,
) {
    let (_monitor, mut statuses) = match heartbeat {
        Some((monitor, rx)) => (Some(monitor), Some(rx)),
        None => (None, None),
    };

    let reason = loop {
        let step = tokio::select! {
            frame = reader.next() => Step::Frame(frame),
            status = next_status(&mut statuses) => Step::Heartbeat(status),
        };

        match step {
            Step::Frame(Some(Ok(Message::Text(text)))) => {
                tracing::trace!(raw = %text.as_str(), "Received frame");
                shared.handle_text(text.as_str(), &outbound, &pongs);
            }
            Step::Frame(Some(Ok(Message::Binary(_)))) => {
                shared.emit_error(BridgeError::Protocol {
                    reason: "unexpected binary frame".into(),
                });
            }
            Step::Frame(Some(Ok(Message::Close(frame)))) => {
                break match frame {
                    Some(frame) if !frame.reason.is_empty() => {
                        format!("editor closed the connection: {}", frame.reason.as_str())
                    }
                    _ => "editor closed the connection".to_string(),
                };
            }
            Step::Frame(Some(Ok(_))) => {}
            Step::Frame(Some(Err(e))) => break format!("read failed: {e}"),
            Step::Frame(None) => break "socket stream ended".to_string(),
            Step::Heartbeat(Some(HeartbeatStatus::Unhealthy { waited })) => {
                break format!("heartbeat not acknowledged within {}ms", waited.as_millis());
            }
            Step::Heartbeat(Some(HeartbeatStatus::Healthy { .. })) => {}
            Step::Heartbeat(None) => statuses = None,
        }
    };

    tracing::debug!(link_id, reason = %reason, "Reader loop exiting");
    shared.link_lost(link_id, reason);
}

// ─── Connection ─────────────────────────────────────────────────────────

/// State-machine-driven WebSocket link to the editor.
///
/// Created together with the receiver of its [`ConnectionEvent`]s. Dropping
/// the connection tears down the socket and any reconnect loop without
/// emitting further events.
pub struct Connection {
    shared: Arc<Shared>,
}

enum ConnectPlan {
    Done,
    Wait,
    Attempt(u64),
}

impl Connection {
    pub fn new(config: BridgeConfig) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let shared = Shared {
            url: config.url(),
            client_name: Mutex::new(config.client_name.clone()),
            config,
            core: Mutex::new(Core {
                state: ConnectionState::Disconnected,
                link: None,
                attempt: 0,
                reconnect_task: None,
                last_failure: None,
                seq: 0,
            }),
            outbox: Mutex::new(VecDeque::new()),
            delivering: AtomicBool::new(false),
            listeners: StateListeners::new(),
            state_tx,
            events,
            next_link_id: AtomicU64::new(0),
        };
        (
            Self {
                shared: Arc::new(shared),
            },
            events_rx,
        )
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// WebSocket URL this connection dials.
    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.core().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Name announced in the handshake of subsequent connection attempts.
    pub fn set_client_name(&self, name: impl Into<String>) {
        *self
            .shared
            .client_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = name.into();
    }

    /// Register a listener for state changes applied from now on.
    pub fn on_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.observe(listener).0
    }

    /// Register a listener and read the current state in one step. Every
    /// transition is either reflected in the returned state or delivered to
    /// the listener, never both and never neither.
    pub fn observe<F>(&self, listener: F) -> (Subscription, ConnectionState)
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        let core = self.shared.core();
        let subscription = self.shared.listeners.subscribe_after(core.seq, listener);
        (subscription, core.state)
    }

    /// Id of the live socket while connected. Changes with every new socket.
    pub fn link_id(&self) -> Option<u64> {
        let core = self.shared.core();
        match (&core.state, &core.link) {
            (ConnectionState::Connected, Some(link)) => Some(link.id),
            _ => None,
        }
    }

    /// Establish the link.
    ///
    /// Returns immediately when already connected. When an attempt or a
    /// reconnect loop is already running, waits for its outcome instead of
    /// opening a second socket.
    ///
    /// # Errors
    /// Returns [`BridgeError::ConnectionFailed`] if the socket or handshake
    /// fails; the state is then `Disconnected`.
    pub async fn connect(&self) -> BridgeResult<()> {
        let plan = self.shared.update(|core| match core.state {
            ConnectionState::Connected => (None, ConnectPlan::Done),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                (None, ConnectPlan::Wait)
            }
            ConnectionState::Disconnected => {
                core.attempt += 1;
                let change = core.transition(ConnectionState::Connecting, None);
                (change, ConnectPlan::Attempt(core.attempt))
            }
        });

        match plan {
            ConnectPlan::Done => Ok(()),
            ConnectPlan::Wait => self.settled().await,
            // Runs as its own task so a dropped caller cannot leave the
            // state stuck in Connecting.
            ConnectPlan::Attempt(token) => {
                match tokio::spawn(Arc::clone(&self.shared).first_connect(token)).await {
                    Ok(result) => result,
                    Err(e) => Err(self.shared.connect_failure(Some(e.to_string()))),
                }
            }
        }
    }

    /// Wait until the state leaves the transient states.
    async fn settled(&self) -> BridgeResult<()> {
        let mut state = self.shared.state_tx.subscribe();
        let settled = state
            .wait_for(|s| !s.is_transient())
            .await
            .map(|s| *s)
            .unwrap_or(ConnectionState::Disconnected);

        if settled == ConnectionState::Connected {
            Ok(())
        } else {
            let reason = self.shared.core().last_failure.clone();
            Err(self.shared.connect_failure(reason))
        }
    }

    /// Queue a text frame for the socket. Returns the id of the socket it
    /// was written to.
    ///
    /// # Errors
    /// Returns [`BridgeError::NotConnected`] unless the state is `Connected`.
    pub fn send(&self, text: String) -> BridgeResult<u64> {
        let core = self.shared.core();
        match (&core.state, &core.link) {
            (ConnectionState::Connected, Some(link)) => link
                .outbound
                .send(Message::text(text))
                .map(|()| link.id)
                .map_err(|_| BridgeError::ConnectionLost {
                    reason: "socket writer stopped".into(),
                }),
            _ => Err(BridgeError::NotConnected),
        }
    }

    /// Close the link and stop any reconnect loop. No-op when already
    /// disconnected.
    pub fn disconnect(&self, reason: &str) {
        self.shared.update(|core| {
            if core.state == ConnectionState::Disconnected {
                return (None, ());
            }
            core.attempt += 1;
            if let Some(task) = core.reconnect_task.take() {
                task.abort();
            }
            if let Some(link) = core.link.take() {
                link.close(reason);
            }
            (
                core.transition(ConnectionState::Disconnected, Some(reason.to_string())),
                (),
            )
        });
    }

    /// Drop the current socket and run the reconnect sequence, resolving
    /// with its outcome.
    ///
    /// From `Disconnected` this is a plain [`connect`](Self::connect); while
    /// an attempt is already in flight it waits for that attempt.
    ///
    /// # Errors
    /// Returns [`BridgeError::ConnectionFailed`] if the link ends up
    /// `Disconnected`.
    pub async fn force_reconnect(&self, reason: &str) -> BridgeResult<()> {
        let connect_fresh = self.shared.update(|core| match core.state {
            ConnectionState::Disconnected => (None, true),
            ConnectionState::Connecting | ConnectionState::Reconnecting => (None, false),
            ConnectionState::Connected => {
                tracing::info!(reason, "Forcing reconnect to editor");
                let change = self.shared.begin_reconnect(core, reason.to_string());
                (change, false)
            }
        });

        if connect_fresh {
            self.connect().await
        } else {
            self.settled().await
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut core = self.shared.core();
        core.attempt += 1;
        if let Some(task) = core.reconnect_task.take() {
            task.abort();
        }
        core.link = None;
    }
}
