//! End-to-end listener tests: singleton start semantics, the HTTP
//! health/debug endpoints, and the WebSocket relay protocol against a
//! fake agent binary.

use futures_util::{SinkExt, StreamExt};
use reviewd::{config::DaemonConfig, server::Listener, AppContext};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

fn test_context(data_dir: &TempDir, port: u16, agent: &str, args: &[&str]) -> Arc<AppContext> {
    let mut config = DaemonConfig::new(
        Some(port),
        Some(data_dir.path().to_path_buf()),
        Some("warn".into()),
        Some(agent.into()),
    );
    config.agent.base_args = args.iter().map(|s| s.to_string()).collect();
    config.agent.transcript_root = data_dir.path().join("transcripts");
    AppContext::new(config, "test-machine".into())
}

async fn http_request(port: u16, request_line: &str) -> String {
    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .unwrap();
    stream
        .write_all(format!("{request_line} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

// ─── Singleton start ─────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn start_is_idempotent_and_concurrent_safe() {
    let dir = TempDir::new().unwrap();
    // Port 0 binds an ephemeral port, proving the cached value is reused.
    let ctx = test_context(&dir, 0, "/bin/echo", &[]);
    let listener = Listener::new(ctx);

    let (a, b) = tokio::join!(listener.start(), listener.start());
    assert!(a.is_some());
    assert_eq!(a, b, "concurrent starts must share one bind");

    let again = listener.start().await;
    assert_eq!(a, again, "later starts return the cached port");
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_failure_is_cached_and_survivable() {
    // Occupy a port so the daemon's bind fails.
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = blocker.local_addr().unwrap().port();

    let dir = TempDir::new().unwrap();
    let ctx = test_context(&dir, port, "/bin/echo", &[]);
    let listener = Listener::new(ctx);

    assert_eq!(listener.start().await, None);
    // No retry: the failure is cached.
    assert_eq!(listener.start().await, None);
}

// ─── HTTP endpoints ──────────────────────────────────────────────────────────

#[tokio::test(flavor = "multi_thread")]
async fn health_debug_and_404_routes() {
    let dir = TempDir::new().unwrap();
    let ctx = test_context(&dir, 0, "/bin/echo", &[]);
    let listener = Listener::new(ctx);
    let port = listener.start().await.unwrap();

    let health = http_request(port, "GET /health").await;
    assert!(health.starts_with("HTTP/1.1 200 OK"));
    assert!(health.contains("\"status\":\"ok\""));
    assert!(health.contains("\"uptime\""));

    let debug = http_request(port, "GET /debug/agents").await;
    assert!(debug.starts_with("HTTP/1.1 200 OK"));
    assert!(debug.contains("\"count\":0"));
    assert!(debug.contains("\"agents\":[]"));

    let missing = http_request(port, "GET /anything-else").await;
    assert!(missing.starts_with("HTTP/1.1 404 Not Found"));
}

// ─── WebSocket relay ─────────────────────────────────────────────────────────

async fn next_frame(
    ws: &mut (impl futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
          + Unpin),
) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn start_agent_round_trip_over_websocket() {
    let dir = TempDir::new().unwrap();
    let ctx = test_context(&dir, 0, "/bin/echo", &[]);
    let listener = Listener::new(ctx);
    let port = listener.start().await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    ws.send(Message::Text(
        r#"{"type":"start-agent","taskId":"t1","prompt":"ws-hello"}"#.to_string(),
    ))
    .await
    .unwrap();

    let started = next_frame(&mut ws).await;
    assert_eq!(started["type"], "started");
    assert_eq!(started["taskId"], "t1");
    assert!(started["pid"].as_u64().is_some());

    let mut saw_output = false;
    loop {
        let frame = next_frame(&mut ws).await;
        match frame["type"].as_str().unwrap() {
            "output" => {
                assert_eq!(frame["stream"], "stdout");
                if frame["data"].as_str().unwrap().contains("ws-hello") {
                    saw_output = true;
                }
            }
            "completed" => {
                assert_eq!(frame["exitCode"], 0);
                break;
            }
            other => panic!("unexpected frame type {other}"),
        }
    }
    assert!(saw_output, "agent stdout must be relayed");
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_errors_keep_the_connection_open() {
    let dir = TempDir::new().unwrap();
    let ctx = test_context(&dir, 0, "/bin/echo", &[]);
    let listener = Listener::new(ctx);
    let port = listener.start().await.unwrap();

    let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    // Malformed JSON → typed error, socket stays usable.
    ws.send(Message::Text("{not json".into())).await.unwrap();
    let err = next_frame(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert!(err["message"].as_str().unwrap().contains("Invalid JSON"));

    // Unknown task stop → typed error.
    ws.send(Message::Text(
        r#"{"type":"stop-agent","taskId":"ghost"}"#.to_string(),
    ))
    .await
    .unwrap();
    let err = next_frame(&mut ws).await;
    assert_eq!(err["type"], "error");
    assert_eq!(err["message"], "No agent found for task");

    // The same connection still serves valid requests.
    ws.send(Message::Text(r#"{"type":"list-agents"}"#.to_string()))
        .await
        .unwrap();
    let agents = next_frame(&mut ws).await;
    assert_eq!(agents["type"], "agents");
    assert_eq!(agents["list"], serde_json::json!([]));
}

#[tokio::test(flavor = "multi_thread")]
async fn multiple_clients_are_multiplexed_independently() {
    let dir = TempDir::new().unwrap();
    let ctx = test_context(&dir, 0, "/bin/echo", &[]);
    let listener = Listener::new(ctx);
    let port = listener.start().await.unwrap();

    let (mut ws1, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();
    let (mut ws2, _) = connect_async(format!("ws://127.0.0.1:{port}"))
        .await
        .unwrap();

    ws1.send(Message::Text(
        r#"{"type":"start-agent","taskId":"client1-task","prompt":"one"}"#.to_string(),
    ))
    .await
    .unwrap();
    ws2.send(Message::Text(
        r#"{"type":"start-agent","taskId":"client2-task","prompt":"two"}"#.to_string(),
    ))
    .await
    .unwrap();

    let started1 = next_frame(&mut ws1).await;
    let started2 = next_frame(&mut ws2).await;
    assert_eq!(started1["taskId"], "client1-task");
    assert_eq!(started2["taskId"], "client2-task");
}
