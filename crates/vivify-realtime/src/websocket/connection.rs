//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use vivify_core::{ServerMessage, TransportError};

use crate::transport::Transport;

/// A connected WebSocket client, as seen by the registry.
///
/// Frames are serialized here and pushed onto a bounded channel drained by
/// the session's write task. A full channel is a send failure.
pub struct ClientConnection {
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// Channel capacity, reported on backpressure.
    capacity: usize,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has sent anything since the last heartbeat check.
    pub is_alive: AtomicBool,
    /// When the last frame of any kind was received.
    last_seen: Mutex<Instant>,
    /// Frames refused because the channel was full or closed.
    dropped_messages: AtomicU64,
    /// Cancelled when the connection is closed from either side.
    closed: CancellationToken,
}

impl ClientConnection {
    /// Create a new connection over the write task's channel.
    pub fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            capacity: tx.max_capacity(),
            tx,
            connected_at: now,
            is_alive: AtomicBool::new(true),
            last_seen: Mutex::new(now),
            dropped_messages: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Push an already-serialized frame.
    pub fn send_text(&self, text: Arc<String>) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.tx.try_send(text).map_err(|error| {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            match error {
                TrySendError::Full(_) => TransportError::Backpressure {
                    capacity: self.capacity,
                },
                TrySendError::Closed(_) => TransportError::Closed,
            }
        })
    }

    /// Total frames refused for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Record inbound activity.
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    /// Time since the last inbound frame (or connection establishment).
    pub fn last_seen_elapsed(&self) -> Duration {
        self.last_seen.lock().elapsed()
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the client was heard from since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Token cancelled once the connection is closed.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Whether the connection has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

#[async_trait]
impl Transport for ClientConnection {
    async fn accept(&self) -> Result<(), TransportError> {
        // The HTTP upgrade already completed; only a socket that died in
        // between can fail here.
        if self.closed.is_cancelled() || self.tx.is_closed() {
            return Err(TransportError::Handshake(
                "socket closed before registration".into(),
            ));
        }
        Ok(())
    }

    fn send(&self, message: &ServerMessage) -> Result<(), TransportError> {
        let json = message.to_json()?;
        self.send_text(Arc::new(json))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
