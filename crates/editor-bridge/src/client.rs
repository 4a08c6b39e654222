//! # Bridge Client
//!
//! Public request/response API over a [`Connection`]. Assigns correlation
//! ids, tracks every in-flight request in a pending table with its own
//! deadline, routes calls either straight to the socket or into the
//! [`CommandQueue`] depending on connection state, and replays the queue
//! serially once the link is restored.
//!
//! ## Usage
//!
//! ```no_run
//! use editor_bridge::{BridgeClient, BridgeConfig, RequestOptions, Request};
//! use serde_json::json;
//! use std::time::Duration;
//!
//! # async fn demo() -> editor_bridge::BridgeResult<()> {
//! let client = BridgeClient::new(BridgeConfig::discover(None)?);
//! client.start("my-tool").await?;
//!
//! let scene = client.call("manage_scene", json!({"action": "get_hierarchy"})).await?;
//! println!("{scene}");
//!
//! // Ask the editor to reload, then block until the link has cycled.
//! client
//!     .send_request(
//!         Request::new("refresh_assets", json!({})),
//!         RequestOptions::default().without_queue(),
//!     )
//!     .await?;
//! client.wait_for_reconnect(Duration::from_secs(60)).await?;
//!
//! client.stop();
//! # Ok(())
//! # }
//! ```
//!
//! ## Routing
//!
//! | State                        | Queueing on                  | Queueing off      |
//! |------------------------------|------------------------------|-------------------|
//! | `Connected`                  | send now                     | send now          |
//! | `Connecting`/`Reconnecting`  | enqueue, settle on replay    | `NotConnected`    |
//! | `Disconnected`               | connect, then send or enqueue| `NotConnected`    |
//!
//! A request queued while the link is `Disconnected` starts a redial
//! sequence with the reconnect backoff, so it is replayed as soon as the
//! editor accepts connections again.
//!
//! ## Settlement
//!
//! Every request settles exactly once through a [`oneshot`] channel: by its
//! response, by its deadline (which also runs while it waits in the queue),
//! by rejection when the socket it was sent on is lost, or by queue clearing
//! when reconnection is abandoned. A timed-out request also requests one
//! forced reconnect, rate-limited by
//! [`ReconnectConfig::force_cooldown_ms`](crate::config::ReconnectConfig::force_cooldown_ms).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::backoff::Backoff;
use crate::config::BridgeConfig;
use crate::connection::{Connection, ConnectionEvent, MAX_RECONNECT_REASON};
use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{Request, Response};
use crate::queue::{CommandQueue, EnqueueOutcome, QueueStats, QueuedCommand, Responder};
use crate::state::{ConnectionState, ConnectionStateChange, Subscription};

/// Reason given to queued commands left unsent when the link drops during a
/// replay pass.
const REPLAY_INTERRUPTED: &str = "connection lost during replay";

/// Reason used when the client is stopped.
const STOPPED: &str = "client stopped";

/// Per-call overrides for [`BridgeClient::send_request`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Deadline for the response. Defaults to `request_timeout_ms`.
    pub timeout: Option<Duration>,

    /// Whether the call may wait in the queue while the link is down.
    /// `None` follows the client-wide setting.
    pub queue: Option<bool>,
}

impl RequestOptions {
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Fail fast with [`BridgeError::NotConnected`] instead of queueing.
    #[must_use]
    pub fn without_queue(mut self) -> Self {
        self.queue = Some(false);
        self
    }

    #[must_use]
    pub fn with_queue(mut self) -> Self {
        self.queue = Some(true);
        self
    }
}

/// An in-flight request awaiting its response.
struct PendingRequest {
    method: String,
    /// Socket the request was written to.
    link: u64,
    responder: Responder,
    timer: JoinHandle<()>,
}

impl PendingRequest {
    fn settle(self, outcome: BridgeResult<serde_json::Value>) {
        self.timer.abort();
        let _ = self.responder.send(outcome);
    }
}

struct ClientInner {
    config: BridgeConfig,
    connection: Connection,
    pending: Mutex<HashMap<String, PendingRequest>>,
    queue: CommandQueue,
    queue_enabled: AtomicBool,
    replaying: AtomicBool,
    redial: Mutex<Option<JoinHandle<()>>>,
    last_forced_reconnect: Mutex<Option<Instant>>,
}

impl ClientInner {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Sending ────────────────────────────────────────────────────────

    /// Register `request` in the pending table and write it to the socket.
    /// `responder` is settled on every path, including immediate failures.
    fn register_and_send(
        self: &Arc<Self>,
        mut request: Request,
        timeout: Duration,
        responder: Responder,
    ) {
        let id = request.ensure_id().to_string();
        let text = match serde_json::to_string(&request) {
            Ok(text) => text,
            Err(e) => {
                let _ = responder.send(Err(e.into()));
                return;
            }
        };

        // The table stays locked across the write, so a response cannot be
        // dispatched before its entry exists.
        let mut pending = self.pending();
        if pending.contains_key(&id) {
            drop(pending);
            let _ = responder.send(Err(BridgeError::Validation {
                reason: format!("request id '{id}' is already in flight"),
            }));
            return;
        }

        tracing::debug!(id = %id, method = %request.method, "Sending request");
        let link = match self.connection.send(text) {
            Ok(link) => link,
            Err(e) => {
                drop(pending);
                let _ = responder.send(Err(e));
                return;
            }
        };
        let timer = tokio::spawn(expire(
            Arc::downgrade(self),
            id.clone(),
            request.method.clone(),
            timeout,
        ));
        pending.insert(
            id,
            PendingRequest {
                method: request.method,
                link,
                responder,
                timer,
            },
        );
    }

    /// Send now and wait for the outcome.
    async fn send_now(
        self: &Arc<Self>,
        request: Request,
        timeout: Duration,
    ) -> BridgeResult<serde_json::Value> {
        let (tx, rx) = oneshot::channel();
        self.register_and_send(request, timeout, tx);
        rx.await.unwrap_or_else(|_| Err(abandoned()))
    }

    /// Queue for replay and wait for the outcome, or for `timeout` if the
    /// command is still queued by then.
    async fn send_later(
        self: &Arc<Self>,
        request: Request,
        timeout: Duration,
    ) -> BridgeResult<serde_json::Value> {
        let (tx, mut rx) = oneshot::channel();
        let command = QueuedCommand::new(request, Some(timeout), tx);
        let id = command.id.clone();
        let method = command.request.method.clone();

        if let EnqueueOutcome::Queued { depth } = self.queue.enqueue(command) {
            tracing::debug!(depth, "Request waiting for the editor link");
            // The state may have moved on while the command was being queued.
            match self.connection.state() {
                ConnectionState::Connected => self.spawn_replay(),
                ConnectionState::Disconnected => self.spawn_redial(),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
            }
        }

        if let Ok(outcome) = tokio::time::timeout(timeout, &mut rx).await {
            return outcome.unwrap_or_else(|_| Err(abandoned()));
        }
        // Once drained for replay, the command's remaining deadline is
        // enforced by the pending table instead.
        if let Some(command) = self.queue.remove(&id) {
            let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
            tracing::warn!(id = %id, method = %method, timeout_ms = millis, "Queued request timed out");
            self.queue.record_expired();
            command.settle(Err(BridgeError::Timeout { method, millis }));
        }
        rx.await.unwrap_or_else(|_| Err(abandoned()))
    }

    // ─── Inbound ────────────────────────────────────────────────────────

    fn handle_message(&self, text: &str) {
        let response: Response = match serde_json::from_str(text) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring frame that is not a response");
                return;
            }
        };

        let Some(id) = response.id.clone() else {
            tracing::debug!("Dropping response without id");
            return;
        };

        let Some(entry) = self.pending().remove(&id) else {
            tracing::debug!(id = %id, "Dropping response for unknown request");
            return;
        };

        let outcome = response.into_result();
        if let Err(e) = &outcome {
            tracing::debug!(id = %id, method = %entry.method, error = %e, "Editor reported failure");
        } else {
            tracing::debug!(id = %id, method = %entry.method, "Request succeeded");
        }
        entry.settle(outcome);
    }

    fn handle_state_change(self: &Arc<Self>, change: &ConnectionStateChange) {
        if change.is_loss() || change.current == ConnectionState::Disconnected {
            let reason = change
                .reason
                .clone()
                .unwrap_or_else(|| format!("connection {}", change.current));
            // By the time this runs the link may already be back; requests
            // written to the new socket are not affected by the old loss.
            self.reject_pending(&reason, self.connection.link_id());

            if change.current == ConnectionState::Disconnected {
                if reason == MAX_RECONNECT_REASON {
                    self.queue.clear(&reason);
                } else if reason != STOPPED && !self.queue.is_empty() {
                    self.spawn_redial();
                }
            }
        }

        if change.is_restore() {
            self.spawn_replay();
        }
    }

    /// Settle every pending request not sent on socket `keep` with
    /// [`BridgeError::ConnectionLost`].
    fn reject_pending(&self, reason: &str, keep: Option<u64>) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut pending = self.pending();
            let lost: Vec<String> = pending
                .iter()
                .filter(|(_, entry)| Some(entry.link) != keep)
                .map(|(id, _)| id.clone())
                .collect();
            lost.iter().filter_map(|id| pending.remove(id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            entry.settle(Err(BridgeError::ConnectionLost {
                reason: reason.to_string(),
            }));
        }
        if count > 0 {
            tracing::warn!(count, reason, "Rejected pending requests");
        }
        count
    }

    // ─── Replay ─────────────────────────────────────────────────────────

    fn spawn_replay(self: &Arc<Self>) {
        if self.queue.is_empty() || self.replaying.swap(true, Ordering::SeqCst) {
            return;
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.replay().await;
            inner.replaying.store(false, Ordering::SeqCst);
            // Commands queued between the last drain and the flag reset.
            if inner.connection.is_connected() {
                inner.spawn_replay();
            }
        });
    }

    async fn replay(self: &Arc<Self>) {
        loop {
            if !self.connection.is_connected() {
                return;
            }
            let batch = self.queue.drain();
            if batch.is_empty() {
                return;
            }
            tracing::info!(count = batch.len(), "Replaying queued requests");

            let mut batch = batch.into_iter();
            while let Some(command) = batch.next() {
                if !self.connection.is_connected() {
                    let remaining = 1 + batch.len();
                    for command in std::iter::once(command).chain(batch) {
                        command.settle(Err(BridgeError::ConnectionLost {
                            reason: REPLAY_INTERRUPTED.to_string(),
                        }));
                    }
                    self.queue.record_rejected(remaining);
                    tracing::warn!(remaining, "Connection dropped during replay");
                    return;
                }

                let queued_for = command.queued_for();
                let (request, timeout, responder) = command.into_parts();
                let timeout = timeout.unwrap_or_else(|| self.config.request_timeout());
                let remaining = timeout.saturating_sub(queued_for);
                if remaining.is_zero() {
                    self.queue.record_expired();
                    let _ = responder.send(Err(BridgeError::Timeout {
                        method: request.method,
                        millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    }));
                    continue;
                }

                tracing::debug!(
                    id = request.id.as_deref().unwrap_or_default(),
                    method = %request.method,
                    queued_ms = u64::try_from(queued_for.as_millis()).unwrap_or(u64::MAX),
                    "Replaying request"
                );
                self.queue.record_replayed();
                let outcome = self.send_now(request, remaining).await;
                let _ = responder.send(outcome);
            }
        }
    }

    // ─── Redial ─────────────────────────────────────────────────────────

    /// Keep dialing a disconnected editor while commands wait in the queue.
    fn spawn_redial(self: &Arc<Self>) {
        if !self.config.reconnect.enabled {
            tracing::debug!("Reconnect disabled, queued requests wait for their deadline");
            return;
        }
        let mut redial = self.redial.lock().unwrap_or_else(PoisonError::into_inner);
        if redial.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        *redial = Some(tokio::spawn(redial_loop(Arc::downgrade(self))));
    }

    fn cancel_redial(&self) {
        if let Some(task) = self
            .redial
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }

    // ─── Timeouts ───────────────────────────────────────────────────────

    /// Ask the connection to cycle, at most once per cooldown and only while
    /// connected.
    fn request_forced_reconnect(self: &Arc<Self>, reason: String) {
        if !self.connection.is_connected() {
            tracing::debug!("Skipping forced reconnect, link is not connected");
            return;
        }

        let cooldown = self.config.reconnect.force_cooldown();
        {
            let mut last = self
                .last_forced_reconnect
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if last.is_some_and(|at| at.elapsed() < cooldown) {
                tracing::debug!("Skipping forced reconnect, cooldown active");
                return;
            }
            *last = Some(Instant::now());
        }

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = inner.connection.force_reconnect(&reason).await {
                tracing::warn!(error = %e, "Forced reconnect failed");
            }
        });
    }
}

fn abandoned() -> BridgeError {
    BridgeError::ConnectionLost {
        reason: "request was abandoned".into(),
    }
}

/// Deadline task for one pending request.
async fn expire(inner: Weak<ClientInner>, id: String, method: String, timeout: Duration) {
    tokio::time::sleep(timeout).await;

    let Some(inner) = inner.upgrade() else {
        return;
    };
    let Some(entry) = inner.pending().remove(&id) else {
        return;
    };

    let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    tracing::warn!(id = %id, method = %method, timeout_ms = millis, "Request timed out");
    let PendingRequest { responder, .. } = entry;
    let _ = responder.send(Err(BridgeError::Timeout {
        method: method.clone(),
        millis,
    }));

    inner.request_forced_reconnect(format!("request '{method}' timed out"));
}

async fn redial_loop(inner: Weak<ClientInner>) {
    let mut backoff = match inner.upgrade() {
        Some(inner) => Backoff::from_config(&inner.config.reconnect),
        None => return,
    };
    // The connect that just failed was the first attempt.
    backoff.next_delay();

    while let Some(delay) = backoff.next_delay() {
        tokio::time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.queue.is_empty() {
            tracing::debug!("Queue is empty, no longer redialing");
            return;
        }

        let attempt = backoff.attempt();
        tracing::info!(
            attempt,
            max_attempts = backoff.max_attempts(),
            "Redialing editor for queued requests"
        );
        match inner.connection.connect().await {
            Ok(()) => {
                inner.spawn_replay();
                return;
            }
            Err(e) => tracing::warn!(attempt, error = %e, "Redial failed"),
        }
    }

    if let Some(inner) = inner.upgrade() {
        tracing::error!(attempts = backoff.attempt(), "Giving up on redialing editor");
        inner.queue.clear(MAX_RECONNECT_REASON);
    }
}

async fn dispatch_events(
    inner: Arc<ClientInner>,
    mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ConnectionEvent::Message(text) => inner.handle_message(&text),
            ConnectionEvent::StateChange(change) => inner.handle_state_change(&change),
            ConnectionEvent::Error(e) => tracing::debug!(error = %e, "Connection reported error"),
        }
    }
    tracing::debug!("Event dispatcher exiting");
}

// ─── BridgeClient ───────────────────────────────────────────────────────

/// Reliable request/response client for the editor bridge.
///
/// Must be used from within a Tokio runtime. Dropping the client closes the
/// socket and stops all background tasks.
pub struct BridgeClient {
    inner: Arc<ClientInner>,
    events: Mutex<Option<mpsc::UnboundedReceiver<ConnectionEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeClient {
    /// Create a client. No connection is made until [`start`](Self::start)
    /// or the first request.
    pub fn new(config: BridgeConfig) -> Self {
        let (connection, events) = Connection::new(config.clone());
        let inner = ClientInner {
            queue: CommandQueue::new(config.queue.capacity),
            queue_enabled: AtomicBool::new(config.queue.enabled),
            config,
            connection,
            pending: Mutex::new(HashMap::new()),
            replaying: AtomicBool::new(false),
            redial: Mutex::new(None),
            last_forced_reconnect: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
            events: Mutex::new(Some(events)),
            dispatcher: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    fn ensure_dispatcher(&self) {
        let Some(events) = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return;
        };
        let handle = tokio::spawn(dispatch_events(Arc::clone(&self.inner), events));
        *self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Announce as `client_name` and connect.
    ///
    /// # Errors
    /// Returns the connection failure if the editor cannot be reached; the
    /// client stays usable and later requests retry the connection.
    pub async fn start(&self, client_name: &str) -> BridgeResult<()> {
        self.ensure_dispatcher();
        self.inner.connection.set_client_name(client_name);
        tracing::info!(client_name, url = %self.inner.connection.url(), "Starting bridge client");
        self.inner.connection.connect().await
    }

    /// Disconnect and settle all pending and queued work with
    /// [`BridgeError::ConnectionLost`].
    pub fn stop(&self) {
        tracing::info!("Stopping bridge client");
        self.inner.cancel_redial();
        self.inner.connection.disconnect(STOPPED);
        self.inner.reject_pending(STOPPED, None);
        self.inner.queue.clear(STOPPED);
    }

    /// Send `request` and wait for its response.
    ///
    /// # Errors
    /// - [`BridgeError::NotConnected`] when the link is down and queueing is
    ///   off for this call
    /// - [`BridgeError::QueueFull`] when the queue is at capacity
    /// - [`BridgeError::Timeout`] when no response arrives in time
    /// - [`BridgeError::ConnectionLost`] when the link drops first
    /// - [`BridgeError::ToolExecution`] when the editor reports a failure
    pub async fn send_request(
        &self,
        mut request: Request,
        options: RequestOptions,
    ) -> BridgeResult<serde_json::Value> {
        if request.method.is_empty() {
            return Err(BridgeError::Validation {
                reason: "method must not be empty".into(),
            });
        }
        self.ensure_dispatcher();
        request.ensure_id();

        let inner = &self.inner;
        let timeout = options
            .timeout
            .unwrap_or_else(|| inner.config.request_timeout());
        let queue_allowed = options.queue.unwrap_or(true) && self.is_queue_enabled();

        match inner.connection.state() {
            ConnectionState::Connected => inner.send_now(request, timeout).await,
            _ if !queue_allowed => Err(BridgeError::NotConnected),
            ConnectionState::Connecting | ConnectionState::Reconnecting => {
                inner.send_later(request, timeout).await
            }
            ConnectionState::Disconnected => match inner.connection.connect().await {
                Ok(()) => inner.send_now(request, timeout).await,
                Err(e) => {
                    tracing::debug!(error = %e, "Connect failed, queueing request");
                    inner.send_later(request, timeout).await
                }
            },
        }
    }

    /// Send `method` with default options.
    ///
    /// # Errors
    /// See [`send_request`](Self::send_request).
    pub async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> BridgeResult<serde_json::Value> {
        self.send_request(Request::new(method, params), RequestOptions::default())
            .await
    }

    /// Register a state-change listener. Dropping the returned
    /// [`Subscription`] unsubscribes it.
    ///
    /// The listener runs synchronously on the task that applied the
    /// transition. It may call back into the client, e.g.
    /// [`stop`](Self::stop); a transition it causes is delivered after the
    /// current one.
    pub fn on_connection_state_change<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        self.inner.connection.on_state_change(listener)
    }

    /// Wait for a full loss-then-restore cycle of the link.
    ///
    /// If the link is not connected when called, the loss half is already
    /// satisfied and the next `Connected` transition completes the wait.
    ///
    /// # Errors
    /// Returns [`BridgeError::ReconnectTimeout`] if the cycle does not
    /// complete within `timeout`.
    pub async fn wait_for_reconnect(&self, timeout: Duration) -> BridgeResult<()> {
        struct Progress {
            lost: bool,
            done: Option<oneshot::Sender<()>>,
        }

        let (tx, rx) = oneshot::channel();
        let progress = Arc::new(Mutex::new(Progress {
            lost: false,
            done: Some(tx),
        }));

        let (subscription, state) = {
            let progress = Arc::clone(&progress);
            self.inner.connection.observe(move |change| {
                let mut progress = progress.lock().unwrap_or_else(PoisonError::into_inner);
                if change.current != ConnectionState::Connected {
                    progress.lost = true;
                } else if progress.lost {
                    if let Some(done) = progress.done.take() {
                        let _ = done.send(());
                    }
                }
            })
        };
        if state != ConnectionState::Connected {
            progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .lost = true;
        }

        let outcome = tokio::time::timeout(timeout, rx).await;
        drop(subscription);

        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(abandoned()),
            Err(_) => Err(BridgeError::ReconnectTimeout {
                millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Cycle the link now, ignoring the timeout-triggered cooldown.
    ///
    /// # Errors
    /// Returns [`BridgeError::ConnectionFailed`] if the link ends up
    /// disconnected.
    pub async fn force_reconnect(&self) -> BridgeResult<()> {
        self.ensure_dispatcher();
        self.inner
            .connection
            .force_reconnect("reconnect requested")
            .await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connection.is_connected()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Turn queueing on or off for calls that do not set
    /// [`RequestOptions::queue`].
    pub fn set_queue_enabled(&self, enabled: bool) {
        self.inner.queue_enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_queue_enabled(&self) -> bool {
        self.inner.queue_enabled.load(Ordering::SeqCst)
    }

    /// Number of requests sent and awaiting a response.
    pub fn pending_request_count(&self) -> usize {
        self.inner.pending().len()
    }
}

impl Drop for BridgeClient {
    fn drop(&mut self) {
        self.inner.cancel_redial();
        if let Some(handle) = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
