//! End-to-end scenarios against a hand-driven mock device.

use std::time::Duration;

use scopewire::{ClientConfig, ControlClient, Endpoint, ReconnectConfig, SubscriptionKind};
use scopewire_test_support::{init_tracing, MockDeviceServer};
use serde_json::json;
use tokio::sync::mpsc;

fn endpoint_for(addr: std::net::SocketAddr) -> Endpoint {
    Endpoint::new(addr.ip().to_string(), addr.port(), 0)
}

fn fast_reconnect_config() -> ClientConfig {
    let mut cfg = ClientConfig::default();
    cfg.reconnect = ReconnectConfig { base: Duration::from_millis(10), cap: Duration::from_millis(50), max_attempts: None };
    cfg
}

/// A basic request resolves within 100ms.
#[tokio::test]
async fn s1_basic_request_resolves() {
    init_tracing();
    let server = MockDeviceServer::start().await.unwrap();
    let endpoint = endpoint_for(server.local_addr());

    let (client, mut conn) = tokio::join!(
        ControlClient::connect(endpoint, ClientConfig::default()),
        server.accept(),
    );
    let client = client.unwrap();
    let mut conn = conn.unwrap();

    let reply_task = tokio::spawn(async move {
        let req = conn.read_json_line().await.unwrap().unwrap();
        assert_eq!(req["method"], "GetTime");
        let id = req["id"].clone();
        conn.write_json(&json!({"id": id, "result": {"time": "2024-01-02T03:04:05Z"}})).await.unwrap();
    });

    let result = tokio::time::timeout(Duration::from_millis(100), client.send("GetTime", json!({})))
        .await
        .expect("send should resolve within 100ms")
        .unwrap();
    assert_eq!(result["time"], "2024-01-02T03:04:05Z");
    reply_task.await.unwrap();
}

/// Responses arriving out of request order still resolve correctly.
#[tokio::test]
async fn s2_interleaved_responses_resolve_to_matching_futures() {
    init_tracing();
    let server = MockDeviceServer::start().await.unwrap();
    let endpoint = endpoint_for(server.local_addr());

    let (client, conn) =
        tokio::join!(ControlClient::connect(endpoint, ClientConfig::default()), server.accept());
    let client = std::sync::Arc::new(client.unwrap());
    let mut conn = conn.unwrap();

    let server_task = tokio::spawn(async move {
        let mut reqs = Vec::new();
        for _ in 0..3 {
            reqs.push(conn.read_json_line().await.unwrap().unwrap());
        }
        // Reply in reverse order.
        for req in reqs.iter().rev() {
            let id = req["id"].clone();
            let method = req["method"].as_str().unwrap().to_owned();
            conn.write_json(&json!({"id": id, "result": {"echo": method}})).await.unwrap();
        }
    });

    let (a, b, c) = tokio::join!(
        client.send("First", json!({})),
        client.send("Second", json!({})),
        client.send("Third", json!({})),
    );
    assert_eq!(a.unwrap()["echo"], "First");
    assert_eq!(b.unwrap()["echo"], "Second");
    assert_eq!(c.unwrap()["echo"], "Third");
    server_task.await.unwrap();
}

/// A mid-command disconnect fails the caller with `Disconnected`, then the
/// transport reconnects and a fresh request succeeds with a reset id
/// counter.
#[tokio::test]
async fn s3_mid_command_disconnect_then_reconnect() {
    init_tracing();
    let server = MockDeviceServer::start().await.unwrap();
    let endpoint = endpoint_for(server.local_addr());

    let (client, conn) = tokio::join!(ControlClient::connect(endpoint.clone(), fast_reconnect_config()), server.accept());
    let client = client.unwrap();
    let mut conn = conn.unwrap();

    let (reconnected_tx, mut reconnected_rx) = mpsc::unbounded_channel();
    let _sub = client.subscribe(SubscriptionKind::Kind(scopewire::KIND_INTERNAL_RECONNECTED.to_owned()), move |_ev| {
        let tx = reconnected_tx.clone();
        async move {
            let _ = tx.send(());
        }
    });

    let send_task = tokio::spawn({
        let client = std::sync::Arc::new(client);
        let client_for_task = client.clone();
        async move {
            let first = client_for_task.send("MoveFocuser", json!({"steps": 10})).await;
            assert!(matches!(first, Err(scopewire::ClientError::Disconnected)));
            client
        }
    });

    // Read the in-flight request, then close without replying.
    let _req = conn.read_json_line().await.unwrap().unwrap();
    conn.close();

    let client = send_task.await.unwrap();

    let (conn2, reconnected) = tokio::join!(server.accept(), reconnected_rx.recv());
    reconnected.expect("InternalReconnected should have fired");
    let mut conn2 = conn2.unwrap();

    let reply_task = tokio::spawn(async move {
        let req = conn2.read_json_line().await.unwrap().unwrap();
        assert_eq!(req["id"], 1, "id counter resets to 1 on a fresh session");
        conn2.write_json(&json!({"id": 1, "result": {"ok": true}})).await.unwrap();
    });

    let second = client.send("MoveFocuser", json!({"steps": 5})).await.unwrap();
    assert_eq!(second["ok"], true);
    reply_task.await.unwrap();
}

/// A request with no reply observes `Timeout` and is removed from the
/// pending table.
#[tokio::test]
async fn s4_timeout_when_device_never_replies() {
    init_tracing();
    let server = MockDeviceServer::start().await.unwrap();
    let endpoint = endpoint_for(server.local_addr());

    let mut config = ClientConfig::default();
    config.command_timeout = Duration::from_millis(200);

    let (client, conn) = tokio::join!(ControlClient::connect(endpoint, config), server.accept());
    let client = client.unwrap();
    let _conn = conn.unwrap(); // never replies

    let started = std::time::Instant::now();
    let result = client.send("NeverReplies", json!({})).await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(scopewire::ClientError::Timeout)));
    assert!(elapsed >= Duration::from_millis(150) && elapsed <= Duration::from_millis(400), "elapsed={elapsed:?}");
}

/// A malformed line is counted and dropped; the next, well-formed response
/// still resolves its request normally.
#[tokio::test]
async fn s6_malformed_line_is_counted_not_fatal() {
    init_tracing();
    let server = MockDeviceServer::start().await.unwrap();
    let endpoint = endpoint_for(server.local_addr());

    let (client, conn) =
        tokio::join!(ControlClient::connect(endpoint, ClientConfig::default()), server.accept());
    let client = client.unwrap();
    let mut conn = conn.unwrap();

    let reply_task = tokio::spawn(async move {
        let req = conn.read_json_line().await.unwrap().unwrap();
        let id = req["id"].clone();
        conn.write_line("{not json").await.unwrap();
        conn.write_json(&json!({"id": id, "result": {"ok": true}})).await.unwrap();
    });

    let result = client.send("Ping", json!({})).await.unwrap();
    assert_eq!(result["ok"], true);
    reply_task.await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.protocol_error_count(), 1);
}
