//! End-to-end tests against a real server on an ephemeral port.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use vivify_realtime::snapshot::StaticSnapshot;
use vivify_realtime::{
    BatchConfig, ConnectionRegistry, RealtimeServer, ServerConfig, SnapshotSource, TaskPublisher,
};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Harness {
    server: RealtimeServer,
    url: String,
}

async fn start(batch: BatchConfig) -> Harness {
    let mut tasks = Map::new();
    let _ = tasks.insert("42".into(), json!({"id": "42", "title": "Ship", "status": "todo"}));

    let config = ServerConfig {
        port: 0,
        ..ServerConfig::default()
    };
    let server = RealtimeServer::new(
        config,
        ConnectionRegistry::new(batch),
        Arc::new(StaticSnapshot(tasks)),
    );
    let (addr, _handle) = server.listen().await.unwrap();
    Harness {
        server,
        url: format!("ws://{addr}/ws"),
    }
}

fn text(s: &str) -> Message {
    Message::Text(s.to_owned().into())
}

/// Next JSON text frame, skipping control frames.
async fn next_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(body) = msg {
            return serde_json::from_str(body.as_str()).unwrap();
        }
    }
}

async fn wait_for_members(registry: &ConnectionRegistry, channel: &str, count: usize) {
    for _ in 0..200 {
        if registry.channel_count(channel).await == count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("channel {channel} never reached {count} members");
}

#[tokio::test]
async fn snapshot_arrives_first() {
    let h = start(BatchConfig::default()).await;
    let (mut client, _) = connect_async(&h.url).await.unwrap();

    let first = next_json(&mut client).await;
    assert_eq!(first["type"], "snapshot");
    assert_eq!(first["data"]["tasks"]["42"]["status"], "todo");

    wait_for_members(h.server.registry(), "tasks", 1).await;
    let publisher = TaskPublisher::new(Arc::clone(h.server.registry()));
    publisher.task_deleted("42").await;

    let second = next_json(&mut client).await;
    assert_eq!(second["type"], "patch");
    assert_eq!(
        second["data"]["patches"][0],
        json!({"op": "remove", "path": "/tasks/42"})
    );
}

#[tokio::test]
async fn status_churn_collapses_and_deletion_flushes_batch() {
    let h = start(BatchConfig {
        max_batch_size: 50,
        max_batch_delay_ms: 2_000,
        enabled: true,
    })
    .await;
    let (mut client, _) = connect_async(&h.url).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "snapshot");
    wait_for_members(h.server.registry(), "tasks", 1).await;

    let publisher = TaskPublisher::new(Arc::clone(h.server.registry()));
    for status in ["todo", "inprogress", "done"] {
        let mut fields = Map::new();
        let _ = fields.insert("status".into(), json!(status));
        publisher.task_updated("42", fields).await;
    }
    publisher.task_deleted("7").await;

    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "batch_patch");
    assert_eq!(frame["data"]["count"], 2);
    assert_eq!(
        frame["data"]["patches"],
        json!([
            {"op": "replace", "path": "/tasks/42/status", "value": "done"},
            {"op": "remove", "path": "/tasks/7"}
        ])
    );
    assert!(frame["data"]["timestamp"].is_string());
}

#[tokio::test]
async fn status_churn_alone_flushes_after_delay() {
    let h = start(BatchConfig {
        max_batch_size: 50,
        max_batch_delay_ms: 50,
        enabled: true,
    })
    .await;
    let (mut client, _) = connect_async(&h.url).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "snapshot");
    wait_for_members(h.server.registry(), "tasks", 1).await;

    let publisher = TaskPublisher::new(Arc::clone(h.server.registry()));
    for status in ["todo", "inprogress", "done"] {
        let mut fields = Map::new();
        let _ = fields.insert("status".into(), json!(status));
        publisher.task_updated("42", fields).await;
    }

    let frame = next_json(&mut client).await;
    assert_eq!(
        frame,
        json!({
            "type": "patch",
            "data": {"patches": [{"op": "replace", "path": "/tasks/42/status", "value": "done"}]}
        })
    );
}

#[tokio::test]
async fn ping_is_echoed_as_pong() {
    let h = start(BatchConfig::default()).await;
    let (mut client, _) = connect_async(&h.url).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "snapshot");

    client
        .send(text(r#"{"type":"ping","timestamp":1700000000}"#))
        .await
        .unwrap();
    let frame = next_json(&mut client).await;
    assert_eq!(frame, json!({"type": "pong", "data": {"timestamp": 1_700_000_000}}));
}

#[tokio::test]
async fn subscribe_control_frame_joins_channel() {
    let h = start(BatchConfig::disabled()).await;
    let (mut client, _) = connect_async(&h.url).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "snapshot");

    client
        .send(text(r#"{"type":"subscribe","channel":"audit"}"#))
        .await
        .unwrap();
    wait_for_members(h.server.registry(), "audit", 1).await;

    let audit = TaskPublisher::on_channel(Arc::clone(h.server.registry()), "audit");
    audit.task_deleted("9").await;
    let frame = next_json(&mut client).await;
    assert_eq!(frame["data"]["patches"][0]["path"], "/tasks/9");
}

#[tokio::test]
async fn malformed_frame_gets_error_then_close() {
    let h = start(BatchConfig::default()).await;
    let (mut client, _) = connect_async(&h.url).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "snapshot");
    wait_for_members(h.server.registry(), "tasks", 1).await;

    client.send(text("not json at all")).await.unwrap();
    let frame = next_json(&mut client).await;
    assert_eq!(frame["type"], "error");

    wait_for_members(h.server.registry(), "tasks", 0).await;
    assert_eq!(h.server.registry().connection_count().await, 0);
}

#[tokio::test]
async fn unknown_control_type_is_ignored() {
    let h = start(BatchConfig::default()).await;
    let (mut client, _) = connect_async(&h.url).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "snapshot");

    client.send(text(r#"{"type":"dance"}"#)).await.unwrap();
    client
        .send(text(r#"{"type":"ping","timestamp":"after"}"#))
        .await
        .unwrap();
    let frame = next_json(&mut client).await;
    assert_eq!(frame["data"]["timestamp"], "after");
    assert_eq!(h.server.registry().connection_count().await, 1);
}

#[tokio::test]
async fn client_disconnect_deregisters() {
    let h = start(BatchConfig::default()).await;
    let (mut client, _) = connect_async(&h.url).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "snapshot");
    wait_for_members(h.server.registry(), "tasks", 1).await;

    client.close(None).await.unwrap();
    wait_for_members(h.server.registry(), "tasks", 0).await;
    assert_eq!(h.server.registry().connection_count().await, 0);
}

#[tokio::test]
async fn health_counts_live_connections() {
    let h = start(BatchConfig::default()).await;
    let (mut client, _) = connect_async(&h.url).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "snapshot");
    wait_for_members(h.server.registry(), "tasks", 1).await;

    let health_url = h.url.replace("ws://", "").replace("/ws", "");
    let mut stream = TcpStream::connect(&health_url).await.unwrap();
    let request = format!("GET /health HTTP/1.1\r\nHost: {health_url}\r\nConnection: close\r\n\r\n");
    tokio::io::AsyncWriteExt::write_all(&mut stream, request.as_bytes())
        .await
        .unwrap();
    let mut response = String::new();
    let _ = tokio::io::AsyncReadExt::read_to_string(&mut stream, &mut response)
        .await
        .unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""connections":1"#));
    assert!(response.contains(r#""channels":1"#));
}

#[tokio::test]
async fn drain_delivers_pending_update_then_closes() {
    let mut tasks = Map::new();
    let _ = tasks.insert("42".into(), json!({"id": "42", "status": "todo"}));
    let server = RealtimeServer::new(
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        },
        ConnectionRegistry::new(BatchConfig {
            max_batch_size: 50,
            max_batch_delay_ms: 60_000,
            enabled: true,
        }),
        Arc::new(StaticSnapshot(tasks)),
    );
    let (addr, handle) = server.listen().await.unwrap();
    let (mut client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    assert_eq!(next_json(&mut client).await["type"], "snapshot");
    wait_for_members(server.registry(), "tasks", 1).await;

    let mut fields = Map::new();
    let _ = fields.insert("status".into(), json!("done"));
    TaskPublisher::new(Arc::clone(server.registry()))
        .task_updated("42", fields)
        .await;

    let report = server
        .shutdown()
        .drain(handle, Some(Duration::from_secs(5)))
        .await;
    assert_eq!(report.flushed, 1);
    assert!(!report.timed_out);

    let frame = next_json(&mut client).await;
    assert_eq!(frame["data"]["patches"][0]["value"], "done");
    assert_eq!(server.registry().connection_count().await, 0);
}

/// Deletes a task on the board while the snapshot is being read.
struct RacingSnapshot {
    registry: Arc<ConnectionRegistry>,
}

#[async_trait::async_trait]
impl SnapshotSource for RacingSnapshot {
    async fn snapshot(&self) -> Map<String, Value> {
        TaskPublisher::new(Arc::clone(&self.registry))
            .task_deleted("42")
            .await;
        let mut tasks = Map::new();
        let _ = tasks.insert("42".into(), json!({"id": "42", "status": "todo"}));
        tasks
    }
}

#[tokio::test]
async fn change_during_snapshot_arrives_after_it() {
    let registry = ConnectionRegistry::new(BatchConfig::default());
    let server = RealtimeServer::new(
        ServerConfig {
            port: 0,
            ..ServerConfig::default()
        },
        Arc::clone(&registry),
        Arc::new(RacingSnapshot { registry }),
    );
    let (addr, _handle) = server.listen().await.unwrap();
    let (mut client, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();

    let first = next_json(&mut client).await;
    assert_eq!(first["type"], "snapshot");
    let second = next_json(&mut client).await;
    assert_eq!(
        second["data"]["patches"][0],
        json!({"op": "remove", "path": "/tasks/42"})
    );
}
