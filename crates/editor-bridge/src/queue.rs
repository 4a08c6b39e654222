//! # Command Queue
//!
//! Bounded FIFO of requests issued while the editor link is down. The
//! [`BridgeClient`](crate::client::BridgeClient) enqueues during
//! connecting/reconnecting outages (typically a domain reload on the editor
//! side), drains the queue for serial replay once the link is restored, and
//! clears it when reconnection is abandoned.
//!
//! Each [`QueuedCommand`] carries the caller's [`oneshot`] responder, so the
//! caller is settled exactly once: by replay, by [`clear`](CommandQueue::clear),
//! by its deadline after [`remove`](CommandQueue::remove), or immediately by
//! [`enqueue`](CommandQueue::enqueue) when the queue is full.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::Request;

/// Receives the eventual outcome of a request.
pub type Responder = oneshot::Sender<BridgeResult<serde_json::Value>>;

/// A request waiting for the link to come back.
#[derive(Debug)]
pub struct QueuedCommand {
    pub id: String,
    pub request: Request,
    /// Deadline counted from `enqueued_at`. Time spent queued is deducted
    /// from the response deadline on replay.
    pub timeout: Option<Duration>,
    pub enqueued_at: Instant,
    responder: Responder,
}

impl QueuedCommand {
    /// Wrap a request, assigning a correlation id if it has none.
    pub fn new(request: Request, timeout: Option<Duration>, responder: Responder) -> Self {
        let mut request = request;
        let id = request.ensure_id().to_string();
        Self {
            id,
            request,
            timeout,
            enqueued_at: Instant::now(),
            responder,
        }
    }

    /// Settle the caller. Consumes the command, so it can only happen once.
    pub fn settle(self, outcome: BridgeResult<serde_json::Value>) {
        if self.responder.send(outcome).is_err() {
            tracing::debug!(id = %self.id, "Queued command caller went away before settlement");
        }
    }

    /// Split into the request parts and the responder, for replay.
    pub fn into_parts(self) -> (Request, Option<Duration>, Responder) {
        (self.request, self.timeout, self.responder)
    }

    /// Time spent waiting in the queue so far.
    pub fn queued_for(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Result of [`CommandQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted; `depth` is the queue length including this command.
    Queued { depth: usize },

    /// Queue was full; the command was settled with [`BridgeError::QueueFull`].
    Dropped,
}

/// Monotonic queue counters plus current occupancy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub replayed: u64,
    pub rejected: u64,
    pub dropped: u64,
    /// Commands whose deadline passed before they could be sent.
    pub expired: u64,
    pub size: usize,
    pub capacity: usize,
}

/// Bounded, ordered buffer of not-yet-sent requests.
#[derive(Debug)]
pub struct CommandQueue {
    items: Mutex<VecDeque<QueuedCommand>>,
    capacity: usize,
    enqueued: AtomicU64,
    replayed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    expired: AtomicU64,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            enqueued: AtomicU64::new(0),
            replayed: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<QueuedCommand>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append `command`, or settle it with a capacity error if the queue is
    /// full. Never blocks.
    pub fn enqueue(&self, command: QueuedCommand) -> EnqueueOutcome {
        let mut items = self.items();
        if items.len() >= self.capacity {
            drop(items);
            self.dropped.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(
                id = %command.id,
                method = %command.request.method,
                capacity = self.capacity,
                "Command queue full, dropping request"
            );
            command.settle(Err(BridgeError::QueueFull {
                capacity: self.capacity,
            }));
            return EnqueueOutcome::Dropped;
        }

        tracing::debug!(
            id = %command.id,
            method = %command.request.method,
            depth = items.len() + 1,
            "Queued request until the editor reconnects"
        );
        items.push_back(command);
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        EnqueueOutcome::Queued { depth: items.len() }
    }

    /// Remove and return every queued command in FIFO order.
    pub fn drain(&self) -> Vec<QueuedCommand> {
        self.items().drain(..).collect()
    }

    /// Take the command with correlation id `id` out of the queue, if it is
    /// still waiting.
    pub fn remove(&self, id: &str) -> Option<QueuedCommand> {
        let mut items = self.items();
        let index = items.iter().position(|command| command.id == id)?;
        items.remove(index)
    }

    /// Settle every queued command with [`BridgeError::ConnectionLost`]
    /// carrying `reason`. Returns the number of commands rejected.
    pub fn clear(&self, reason: &str) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for command in drained {
            command.settle(Err(BridgeError::ConnectionLost {
                reason: reason.to_string(),
            }));
        }
        if count > 0 {
            self.record_rejected(count);
            tracing::info!(count, reason, "Rejected queued requests");
        }
        count
    }

    /// Count a command that went out through replay.
    pub fn record_replayed(&self) {
        self.replayed.fetch_add(1, Ordering::SeqCst);
    }

    /// Count commands rejected outside of [`clear`](Self::clear), e.g. the
    /// unsent tail of an interrupted replay.
    pub fn record_rejected(&self, count: usize) {
        self.rejected
            .fetch_add(u64::try_from(count).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    /// Count a command that timed out before it was sent.
    pub fn record_expired(&self) {
        self.expired.fetch_add(1, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::SeqCst),
            replayed: self.replayed.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            dropped: self.dropped.load(Ordering::SeqCst),
            expired: self.expired.load(Ordering::SeqCst),
            size: self.len(),
            capacity: self.capacity,
        }
    }
}
