//! # Heartbeat Monitor
//!
//! Per-socket background task that periodically sends a `ping` control frame
//! and waits for the matching `pong`, to detect a half-open or silently dead
//! socket before any application request would surface the problem.
//!
//! Used internally by [`Connection`](crate::connection::Connection); a single
//! missed pong is reported as [`HeartbeatStatus::Unhealthy`] and ends the
//! monitor.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;

use crate::config::HeartbeatConfig;
use crate::protocol::ControlFrame;

/// Signals emitted by the heartbeat monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatStatus {
    /// The peer answered the ping.
    Healthy { round_trip: Duration },

    /// No pong arrived within the configured window.
    Unhealthy { waited: Duration },
}

/// Background liveness check bound to one socket.
pub struct HeartbeatMonitor {
    handle: JoinHandle<()>,
}

impl HeartbeatMonitor {
    /// Start the monitor.
    ///
    /// `outbound` is the socket writer queue; `pongs` counts pong frames
    /// received by the socket reader. Returns the monitor handle and a
    /// receiver for status events. The monitor stops after reporting
    /// `Unhealthy`, when the writer queue closes, or when the handle is
    /// dropped.
    pub fn start(
        config: &HeartbeatConfig,
        outbound: mpsc::UnboundedSender<Message>,
        mut pongs: watch::Receiver<u64>,
    ) -> (Self, mpsc::Receiver<HeartbeatStatus>) {
        let interval = config.interval();
        let window = config.timeout();
        let (tx, rx) = mpsc::channel(16);

        let handle = tokio::spawn(async move {
            let mut sent: u64 = *pongs.borrow();

            loop {
                tokio::time::sleep(interval).await;

                sent += 1;
                if outbound
                    .send(Message::text(ControlFrame::Ping.to_text()))
                    .is_err()
                {
                    break;
                }
                let started = Instant::now();

                match tokio::time::timeout(window, pongs.wait_for(|seen| *seen >= sent)).await {
                    Ok(Ok(_)) => {
                        let round_trip = started.elapsed();
                        tracing::trace!(
                            round_trip_ms = u64::try_from(round_trip.as_millis()).unwrap_or(u64::MAX),
                            "Heartbeat acknowledged"
                        );
                        let _ = tx.try_send(HeartbeatStatus::Healthy { round_trip });
                    }
                    Ok(Err(_)) => break,
                    Err(_) => {
                        tracing::warn!(
                            waited_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX),
                            "Heartbeat not acknowledged"
                        );
                        let _ = tx.try_send(HeartbeatStatus::Unhealthy { waited: window });
                        break;
                    }
                }
            }

            tracing::debug!("Heartbeat monitor stopped");
        });

        (Self { handle }, rx)
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
