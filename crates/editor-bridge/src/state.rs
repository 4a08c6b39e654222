//! # Connection State
//!
//! The four-state lifecycle of the editor link and the observer registry
//! that fans state changes out to listeners.
//!
//! ```text
//!                 ┌──────────────┐
//!        ┌───────►│ Disconnected │◄──────────────┐
//!        │        └──────┬───────┘               │
//!        │               │ connect()             │ max attempts /
//!        │ failure       ▼                       │ disconnect()
//!   ┌────┴──────┐  handshake ok  ┌───────────┐   │
//!   │ Connecting├───────────────►│ Connected │───┤
//!   └───────────┘                └────┬──────┘   │
//!                                     │ ▲        │
//!                      liveness lost  │ │ restored
//!                                     ▼ │        │
//!                              ┌────────┴─────┐  │
//!                              │ Reconnecting ├──┘
//!                              └──────────────┘
//! ```
//!
//! Only [`Connection`](crate::connection::Connection) drives transitions.
//! Everything else observes them through [`StateListeners`].

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use crate::error::{BridgeError, BridgeResult};

/// Lifecycle state of the editor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket. Initial and terminal state.
    Disconnected,

    /// First connection attempt (socket + handshake) in flight.
    Connecting,

    /// Handshake completed; requests can be sent.
    Connected,

    /// Liveness was lost; the reconnect loop is running.
    Reconnecting,
}

impl ConnectionState {
    /// Returns `true` if moving from `self` to `next` is an allowed transition.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{Connected, Connecting, Disconnected, Reconnecting};
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected | Disconnected)
                | (Connected, Reconnecting | Disconnected)
                | (Reconnecting, Connected | Disconnected)
        )
    }

    /// Returns `true` while a connection attempt is in flight.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Reconnecting
        )
    }

    /// Lower-case label used in logs.
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }

    /// Validate and build the change record for `self -> next`.
    ///
    /// # Errors
    /// Returns [`BridgeError::InvalidTransition`] if the pair is not allowed.
    pub fn transition(
        self,
        next: ConnectionState,
        reason: Option<String>,
    ) -> BridgeResult<ConnectionStateChange> {
        if self.can_transition_to(next) {
            Ok(ConnectionStateChange {
                previous: self,
                current: next,
                reason,
            })
        } else {
            Err(BridgeError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a single state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStateChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub reason: Option<String>,
}

impl ConnectionStateChange {
    /// Returns `true` if this change restored the link after an outage or
    /// completed the first connect.
    pub fn is_restore(&self) -> bool {
        self.current == ConnectionState::Connected && self.previous.is_transient()
    }

    /// Returns `true` if this change left the connected state.
    pub fn is_loss(&self) -> bool {
        self.previous == ConnectionState::Connected && self.current != ConnectionState::Connected
    }
}

/// Callback invoked synchronously on every state change.
pub type StateListener = Arc<dyn Fn(&ConnectionStateChange) + Send + Sync>;

struct Entry {
    id: u64,
    /// Changes numbered at or below this were applied before the listener
    /// registered and are skipped.
    after: u64,
    listener: StateListener,
}

#[derive(Default)]
struct Registry {
    next_id: AtomicU64,
    listeners: Mutex<Vec<Entry>>,
}

/// Observer registry for [`ConnectionStateChange`] notifications.
///
/// Every change carries a sequence number assigned when the transition was
/// applied. Listeners run in registration order, outside of any connection
/// lock, so they may call back into the connection; a transition caused by a
/// listener is delivered after the current one. A panicking listener is
/// logged and skipped.
#[derive(Clone, Default)]
pub struct StateListeners {
    inner: Arc<Registry>,
}

impl StateListeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for changes numbered above `seq`. It stays
    /// registered until the returned [`Subscription`] is dropped or
    /// [`unsubscribed`](Subscription::unsubscribe).
    pub fn subscribe_after<F>(&self, seq: u64, listener: F) -> Subscription
    where
        F: Fn(&ConnectionStateChange) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Entry {
                id,
                after: seq,
                listener: Arc::new(listener),
            });
        Subscription {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Deliver change number `seq` to every listener registered before it
    /// was applied.
    pub fn notify(&self, seq: u64, change: &ConnectionStateChange) {
        // Snapshot so listeners may subscribe/unsubscribe while being notified.
        let snapshot: Vec<StateListener> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.after < seq)
            .map(|entry| Arc::clone(&entry.listener))
            .collect();

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(change))).is_err() {
                tracing::warn!(
                    previous = %change.previous,
                    current = %change.current,
                    "State change listener panicked"
                );
            }
        }
    }
}

/// Handle returned by [`StateListeners::subscribe_after`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener immediately"]
pub struct Subscription {
    registry: Weak<Registry>,
    id: u64,
}

impl Subscription {
    /// Remove the listener now.
    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        // The listener itself is dropped after the registry lock is released.
        let removed = {
            let mut listeners = registry
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            listeners
                .iter()
                .position(|entry| entry.id == self.id)
                .map(|index| listeners.remove(index))
        };
        drop(removed);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
