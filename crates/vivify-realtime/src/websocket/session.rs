//! WebSocket session lifecycle: handles a single connected client from
//! upgrade through disconnect.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use vivify_core::protocol::parse_client_frame;
use vivify_core::{ClientMessage, ServerMessage, SubscriberId};

use super::connection::ClientConnection;
use crate::config::ServerConfig;
use crate::registry::ConnectionRegistry;
use crate::snapshot::SnapshotSource;
use crate::transport::Transport;

/// How long the write task gets to drain queued frames after close.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a session needs besides its socket.
#[derive(Clone)]
pub struct SessionContext {
    /// Subscriber registry shared by all sessions.
    pub registry: Arc<ConnectionRegistry>,
    /// Source of the on-connect snapshot.
    pub snapshots: Arc<dyn SnapshotSource>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Cancelled on server shutdown.
    pub shutdown: CancellationToken,
}

/// Run a WebSocket session for a connected client.
///
/// 1. Registers the client and sends its `snapshot`
/// 2. Joins the configured default channels
/// 3. Forwards outbound frames and sends periodic Ping frames
/// 4. Handles `ping`, `subscribe`, `unsubscribe`, and `flush` control frames
/// 5. Deregisters on close, heartbeat timeout, malformed input, or shutdown
#[instrument(skip_all, fields(subscriber_id))]
pub async fn run_ws_session(ws: WebSocket, ctx: SessionContext) {
    let (mut ws_tx, mut ws_rx) = ws.split();

    let (send_tx, mut send_rx) = mpsc::channel::<Arc<String>>(ctx.config.outbound_queue_capacity);
    let connection = Arc::new(ClientConnection::new(send_tx));

    let Some(id) = ctx
        .registry
        .register(Arc::clone(&connection) as Arc<dyn Transport>)
        .await
    else {
        return;
    };
    let _ = tracing::Span::current().record("subscriber_id", id.as_str());
    info!("client connected");

    // Join before reading the snapshot so no change falls between the two;
    // anything broadcast meanwhile is held until the snapshot is out.
    let _ = ctx.registry.hold(&id).await;
    for channel in &ctx.config.default_channels {
        let _ = ctx.registry.subscribe(&id, channel).await;
    }
    let snapshot = ctx.snapshots.snapshot().await;
    ctx.registry
        .send_immediate(&id, ServerMessage::snapshot(snapshot))
        .await;
    let _ = ctx.registry.release(&id).await;

    // Spawn outbound forwarder with periodic Ping frames.
    let outbound_conn = Arc::clone(&connection);
    let ping_every = ctx.config.heartbeat_interval();
    let silence_limit = ctx.config.heartbeat_timeout();
    let outbound = tokio::spawn(async move {
        let closed = outbound_conn.closed();
        let mut ping_interval = tokio::time::interval(ping_every);
        // Skip the immediate first tick
        let _ = ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = send_rx.recv() => {
                    let Some(text) = msg else { break };
                    if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if !outbound_conn.check_alive()
                        && outbound_conn.last_seen_elapsed() > silence_limit
                    {
                        warn!(timeout_secs = silence_limit.as_secs(), "client unresponsive, disconnecting");
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
                () = closed.cancelled() => {
                    // Best effort: flush frames queued before the close.
                    while let Ok(text) = send_rx.try_recv() {
                        if ws_tx.send(Message::Text(String::clone(&text).into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        outbound_conn.close();
    });

    let closed = connection.closed();
    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = closed.cancelled() => break,
            () = ctx.shutdown.cancelled() => {
                debug!("server shutting down, closing session");
                let _ = ctx.registry.flush_connection(&id).await;
                break;
            }
        };
        let Some(Ok(msg)) = frame else { break };
        connection.mark_alive();

        let text = match msg {
            Message::Text(t) => t.as_str().to_owned(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(s) => s,
                Err(_) => {
                    reject_malformed(&ctx.registry, &id, "binary frame is not UTF-8").await;
                    break;
                }
            },
            Message::Close(_) => {
                info!("client sent close frame");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        match parse_client_frame(&text) {
            Ok(Some(command)) => handle_control(&ctx.registry, &id, command).await,
            Ok(None) => {}
            Err(error) => {
                reject_malformed(&ctx.registry, &id, &error.to_string()).await;
                break;
            }
        }
    }

    // Clean up
    let _ = ctx.registry.deregister(&id).await;
    connection.close();
    let abort = outbound.abort_handle();
    if tokio::time::timeout(DRAIN_TIMEOUT, outbound).await.is_err() {
        abort.abort();
    }
    info!(
        age_secs = connection.age().as_secs(),
        dropped = connection.drop_count(),
        "client disconnected"
    );
}

async fn handle_control(registry: &ConnectionRegistry, id: &SubscriberId, command: ClientMessage) {
    match command {
        ClientMessage::Ping { timestamp } => {
            registry.send_immediate(id, ServerMessage::pong(timestamp)).await;
        }
        ClientMessage::Subscribe { channel } => {
            let _ = registry.subscribe(id, &channel).await;
        }
        ClientMessage::Unsubscribe { channel } => {
            let _ = registry.unsubscribe(id, &channel).await;
        }
        ClientMessage::Flush => {
            let _ = registry.flush_connection(id).await;
        }
    }
}

async fn reject_malformed(registry: &ConnectionRegistry, id: &SubscriberId, reason: &str) {
    warn!(reason, "malformed client frame, closing stream");
    registry
        .send_immediate(id, ServerMessage::error(format!("malformed frame: {reason}")))
        .await;
}
