#![allow(dead_code)]

//! In-process editor peer. Each accepted socket completes the bridge
//! handshake, answers heartbeat pings on its own and forwards every other
//! frame to the test as a request.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;

pub const STEP_TIMEOUT: Duration = Duration::from_secs(3);

/// Switches shared by every socket of one mock editor.
#[derive(Default)]
struct Behavior {
    refusing: AtomicBool,
    ignore_pings: AtomicBool,
    pings_seen: AtomicUsize,
    handshake_delay_ms: AtomicU64,
    accepted: AtomicUsize,
}

/// Editor side of one client socket.
pub struct MockConnection {
    index: usize,
    client_name: String,
    requests: mpsc::UnboundedReceiver<Value>,
    /// `None` drops the socket without a close frame.
    outbound: mpsc::UnboundedSender<Option<String>>,
}

impl MockConnection {
    /// Zero-based position among the sockets this editor accepted.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Name the client announced in its handshake.
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    pub async fn recv_request(&mut self) -> Value {
        timeout(STEP_TIMEOUT, self.requests.recv())
            .await
            .expect("timed out waiting for request")
            .expect("socket closed before a request arrived")
    }

    pub async fn recv_request_method(&mut self, method: &str) -> Value {
        let request = self.recv_request().await;
        assert_eq!(request["method"], method, "unexpected request: {request}");
        request
    }

    /// Returns a request if one arrives within `wait`.
    pub async fn try_recv_request(&mut self, wait: Duration) -> Option<Value> {
        timeout(wait, self.requests.recv()).await.ok().flatten()
    }

    /// Write raw text, e.g. a frame that is not JSON.
    pub fn send_text(&self, text: &str) {
        let _ = self.outbound.send(Some(text.to_string()));
    }

    pub fn send_json(&self, value: Value) {
        self.send_text(&value.to_string());
    }

    pub fn send_result(&self, id: &str, result: Value) {
        self.send_json(json!({"id": id, "result": result}));
    }

    pub fn send_error(&self, id: &str, kind: &str, message: &str) {
        self.send_json(json!({"id": id, "error": {"message": message, "kind": kind}}));
    }

    /// Drop the socket as a crashing or reloading editor would.
    pub fn force_close(&self) {
        let _ = self.outbound.send(None);
    }
}

/// Editor listening on an ephemeral localhost port.
pub struct MockEditorServer {
    addr: SocketAddr,
    behavior: Arc<Behavior>,
    connections: mpsc::UnboundedReceiver<MockConnection>,
    server_task: JoinHandle<()>,
}

impl MockEditorServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let behavior = Arc::new(Behavior::default());
        let (connection_tx, connections) = mpsc::unbounded_channel();

        let server_behavior = Arc::clone(&behavior);
        let server_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                // An editor mid-reload: the port is open but no upgrade
                // completes.
                if server_behavior.refusing.load(Ordering::SeqCst) {
                    continue;
                }
                tokio::spawn(serve(
                    stream,
                    Arc::clone(&server_behavior),
                    connection_tx.clone(),
                ));
            }
        });

        Ok(Self {
            addr,
            behavior,
            connections,
            server_task,
        })
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// When `false`, new sockets are dropped before the WebSocket upgrade.
    pub fn set_accepting(&self, accepting: bool) {
        self.behavior.refusing.store(!accepting, Ordering::SeqCst);
    }

    /// When `false`, heartbeat pings go unanswered.
    pub fn set_answer_pings(&self, answer: bool) {
        self.behavior.ignore_pings.store(!answer, Ordering::SeqCst);
    }

    /// Hold back the handshake acknowledgment of new sockets.
    pub fn set_handshake_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.behavior.handshake_delay_ms.store(millis, Ordering::SeqCst);
    }

    pub fn pings_seen(&self) -> usize {
        self.behavior.pings_seen.load(Ordering::SeqCst)
    }

    pub async fn accept_connection(&mut self) -> MockConnection {
        timeout(STEP_TIMEOUT, self.connections.recv())
            .await
            .expect("timed out waiting for client connection")
            .expect("mock editor stopped")
    }

    pub async fn try_accept_connection(&mut self, wait: Duration) -> Option<MockConnection> {
        timeout(wait, self.connections.recv()).await.ok().flatten()
    }
}

impl Drop for MockEditorServer {
    fn drop(&mut self) {
        self.server_task.abort();
    }
}

async fn serve(
    stream: TcpStream,
    behavior: Arc<Behavior>,
    connections: mpsc::UnboundedSender<MockConnection>,
) {
    let Ok(mut ws) = accept_async(stream).await else {
        return;
    };

    let hello: Value = match ws.next().await {
        Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap_or_default(),
        _ => return,
    };
    if hello["type"] != "handshake" {
        return;
    }
    let delay = behavior.handshake_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let ack = json!({"type": "handshake_ack", "serverVersion": "mock-editor"});
    if ws.send(Message::text(ack.to_string())).await.is_err() {
        return;
    }

    let (request_tx, requests) = mpsc::unbounded_channel();
    let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Option<String>>();
    let connection = MockConnection {
        index: behavior.accepted.fetch_add(1, Ordering::SeqCst),
        client_name: hello["clientName"].as_str().unwrap_or_default().to_string(),
        requests,
        outbound,
    };
    if connections.send(connection).is_err() {
        return;
    }

    // The socket outlives a dropped MockConnection.
    let mut scripted = true;
    loop {
        tokio::select! {
            out = outbound_rx.recv(), if scripted => match out {
                Some(Some(text)) => {
                    if ws.send(Message::text(text)).await.is_err() {
                        return;
                    }
                }
                Some(None) => return,
                None => scripted = false,
            },
            frame = ws.next() => {
                let Some(Ok(Message::Text(text))) = frame else {
                    return;
                };
                let Ok(value) = serde_json::from_str::<Value>(text.as_str()) else {
                    continue;
                };
                if value["type"] == "ping" {
                    behavior.pings_seen.fetch_add(1, Ordering::SeqCst);
                    if !behavior.ignore_pings.load(Ordering::SeqCst)
                        && ws.send(Message::text(json!({"type": "pong"}).to_string())).await.is_err()
                    {
                        return;
                    }
                    continue;
                }
                let _ = request_tx.send(value);
            }
        }
    }
}
