//! Server shutdown: deliver what subscribers are owed, end their sessions,
//! then stop the listener.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::ConnectionRegistry;

/// How long sessions get to close on their own.
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for sessions to deregister.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Outcome of [`ShutdownCoordinator::drain`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Subscribers whose pending batch was delivered before closing.
    pub flushed: usize,
    /// Subscribers still registered at the deadline, closed forcibly.
    pub forced: usize,
    /// Whether the deadline passed before every session ended.
    pub timed_out: bool,
}

/// Owns the shutdown token every session and the listener watch.
pub struct ShutdownCoordinator {
    token: CancellationToken,
    registry: Arc<ConnectionRegistry>,
}

impl ShutdownCoordinator {
    /// Coordinator for the subscribers of `registry`.
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            token: CancellationToken::new(),
            registry,
        }
    }

    /// Token cancelled when shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel the token without waiting for anything.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has started.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Orderly stop.
    ///
    /// Pending batches are flushed first, so nothing queued is lost. The
    /// token is then cancelled and sessions get up to `timeout` to
    /// deregister; any still registered after that are closed here. Finally
    /// `listener` is awaited, and aborted if it does not stop within the
    /// same timeout.
    pub async fn drain(&self, listener: JoinHandle<()>, timeout: Option<Duration>) -> DrainReport {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);

        let flushed = self.registry.flush_all_connections().await;
        self.shutdown();
        info!(
            flushed,
            connections = self.registry.connection_count().await,
            timeout_ms = timeout.as_millis(),
            "draining subscribers"
        );

        let timed_out = tokio::time::timeout(timeout, self.sessions_closed())
            .await
            .is_err();
        let forced = if timed_out {
            let forced = self.registry.disconnect_all().await;
            warn!(forced, "sessions did not close in time, disconnecting");
            forced
        } else {
            0
        };

        let abort = listener.abort_handle();
        if tokio::time::timeout(timeout, listener).await.is_err() {
            warn!("listener did not stop in time, aborting");
            abort.abort();
        }

        DrainReport {
            flushed,
            forced,
            timed_out,
        }
    }

    async fn sessions_closed(&self) {
        while self.registry.connection_count().await > 0 {
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::transport::Transport;
    use crate::websocket::connection::ClientConnection;
    use serde_json::{Value, json};
    use tokio::sync::mpsc;
    use vivify_core::patch::task_field_patch;
    use vivify_core::{Priority, ServerMessage, SubscriberId};

    fn slow_registry() -> Arc<ConnectionRegistry> {
        ConnectionRegistry::new(BatchConfig {
            max_batch_size: 50,
            max_batch_delay_ms: 60_000,
            enabled: true,
        })
    }

    async fn connect(
        registry: &Arc<ConnectionRegistry>,
    ) -> (SubscriberId, Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let connection = Arc::new(ClientConnection::new(tx));
        let id = registry
            .register(Arc::clone(&connection) as Arc<dyn Transport>)
            .await
            .unwrap();
        (id, connection, rx)
    }

    /// A listener that stops once the token is cancelled.
    fn listener(coord: &ShutdownCoordinator) -> JoinHandle<()> {
        let token = coord.token();
        tokio::spawn(async move { token.cancelled().await })
    }

    #[test]
    fn shutdown_cancels_issued_tokens() {
        let coord = ShutdownCoordinator::new(slow_registry());
        let token = coord.token();
        assert!(!coord.is_shutting_down());
        coord.shutdown();
        coord.shutdown();
        assert!(coord.is_shutting_down());
        assert!(token.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_delivers_pending_batches_before_sessions_end() {
        let registry = slow_registry();
        let coord = ShutdownCoordinator::new(Arc::clone(&registry));
        let (id, _connection, mut rx) = connect(&registry).await;

        let update = ServerMessage::patch(vec![task_field_patch("7", "status", json!("done"))]);
        registry.send(&id, update, Priority::NORMAL).await;
        assert!(rx.try_recv().is_err());

        // Session stand-in: deregisters once shutdown starts.
        let token = coord.token();
        let session_registry = Arc::clone(&registry);
        let session = tokio::spawn(async move {
            token.cancelled().await;
            let _ = session_registry.deregister(&id).await;
        });

        let report = coord.drain(listener(&coord), None).await;
        assert_eq!(
            report,
            DrainReport {
                flushed: 1,
                forced: 0,
                timed_out: false
            }
        );
        session.await.unwrap();

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["data"]["patches"][0]["path"], "/tasks/7/status");
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_disconnects_sessions_that_outlive_the_deadline() {
        let registry = slow_registry();
        let coord = ShutdownCoordinator::new(Arc::clone(&registry));
        let (_id, connection, _rx) = connect(&registry).await;

        let report = coord
            .drain(listener(&coord), Some(Duration::from_millis(100)))
            .await;
        assert!(report.timed_out);
        assert_eq!(report.forced, 1);
        assert_eq!(report.flushed, 0);
        assert!(connection.is_closed());
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_aborts_a_stuck_listener() {
        let coord = ShutdownCoordinator::new(slow_registry());
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let report = coord.drain(stuck, Some(Duration::from_millis(50))).await;
        assert_eq!(report, DrainReport::default());
        assert!(coord.is_shutting_down());
    }
}
