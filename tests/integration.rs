//! Integration tests for Toolgate
//!
//! Each test runs a real gateway on an ephemeral port with the `mock-worker`
//! binary as its worker and talks to it over WebSocket and raw HTTP.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use toolgate::config::{Config, WorkerConfig};
use toolgate::health::HealthReporter;
use toolgate::multiplexer::Multiplexer;
use toolgate::server::GatewayServer;
use toolgate::supervisor::{Supervisor, WorkerPhase};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Worker config running the mock worker with short test timings
fn mock_worker_config() -> WorkerConfig {
    let mut worker = WorkerConfig::local(env!("CARGO_BIN_EXE_mock-worker"));
    worker.max_restarts = 3;
    worker.restart_backoff_ms = 50;
    worker.stable_runtime_ms = 60_000;
    worker.discovery_delay_ms = 50;
    worker.shutdown_grace_period_ms = 1000;
    worker
}

struct TestGateway {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    supervisor: Arc<Supervisor>,
    server_handle: tokio::task::JoinHandle<()>,
}

impl TestGateway {
    async fn start(worker: WorkerConfig) -> Self {
        let mut config = Config::default();
        config.worker = worker;
        Self::start_with_config(config).await
    }

    async fn start_with_config(config: Config) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mux = Multiplexer::new(&config);
        let supervisor = Supervisor::new(config.worker.clone(), Arc::clone(&mux));
        let health = HealthReporter::new(
            Arc::clone(&supervisor),
            Arc::clone(&mux),
            config.health.inactivity_timeout(),
        );

        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = GatewayServer::bind(addr, mux, health, shutdown_rx)
            .await
            .expect("gateway should bind");
        let port = server.local_addr().port();

        supervisor.start();
        let server_handle = tokio::spawn(async move {
            server.run().await.expect("gateway server failed");
        });

        Self {
            port,
            shutdown_tx,
            supervisor,
            server_handle,
        }
    }

    async fn connect(&self) -> Client {
        let (ws, _) = connect_async(format!("ws://127.0.0.1:{}/", self.port))
            .await
            .expect("WebSocket connect");
        ws
    }

    /// Wait until tool discovery has completed for the current worker
    async fn wait_ready(&self) {
        for _ in 0..100 {
            let (_, body) = http_get(self.port, "/health").await.unwrap();
            let health: Value = serde_json::from_str(&body).unwrap();
            if health["toolsCached"] == true {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("worker never became ready");
    }

    async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.supervisor.stop().await;
        let _ = tokio::time::timeout(Duration::from_secs(5), self.server_handle).await;
    }
}

/// Send a simple HTTP request and return the status code and body
async fn http_get(port: u16, path: &str) -> Result<(u16, String), Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;

    let status = response
        .split_whitespace()
        .nth(1)
        .ok_or("missing status line")?
        .parse()?;
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

async fn send(client: &mut Client, message: Value) {
    client
        .send(Message::Text(message.to_string()))
        .await
        .expect("send frame");
}

async fn call(client: &mut Client, id: i64, name: &str, arguments: Value) {
    send(
        client,
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": { "name": name, "arguments": arguments },
        }),
    )
    .await;
}

/// Next JSON text frame, or `None` on timeout or close
async fn recv(client: &mut Client, timeout: Duration) -> Option<Value> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let frame = tokio::time::timeout_at(deadline, client.next()).await.ok()??;
        match frame {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn expect_reply(client: &mut Client) -> Value {
    recv(client, Duration::from_secs(5))
        .await
        .expect("expected a reply from the gateway")
}

#[tokio::test]
async fn test_handshake_and_capability_gating() {
    let mut worker = mock_worker_config();
    worker.discovery_delay_ms = 500;
    let gateway = TestGateway::start(worker).await;
    let mut client = gateway.connect().await;

    send(&mut client, json!({ "jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {} })).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["protocolVersion"], "2024-11-05");
    assert!(reply["result"]["serverInfo"]["name"].is_string());

    send(&mut client, json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" })).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["error"]["code"], -32000);

    gateway.wait_ready().await;

    send(&mut client, json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/list" })).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["id"], 3);
    let tools = reply["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0]["name"], "browser_navigate");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_tools_announced_by_initialized_notification() {
    let mut worker = mock_worker_config();
    worker.discovery_delay_ms = 60_000;
    worker.env.insert("MOCK_ANNOUNCE_TOOLS".to_string(), "1".to_string());
    let gateway = TestGateway::start(worker).await;
    gateway.wait_ready().await;

    let mut client = gateway.connect().await;
    send(&mut client, json!({ "jsonrpc": "2.0", "id": "list", "method": "tools/list" })).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["id"], "list");
    assert_eq!(reply["result"]["tools"].as_array().unwrap().len(), 2);

    // The initialization notification is consumed, not broadcast
    assert!(recv(&mut client, Duration::from_millis(200)).await.is_none());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_discovery_does_not_block_invocations() {
    let mut worker = mock_worker_config();
    worker.discovery_timeout_ms = 300;
    worker.env.insert("MOCK_SILENT_DISCOVERY".to_string(), "1".to_string());
    let gateway = TestGateway::start(worker).await;
    let mut client = gateway.connect().await;

    // Discovery is outstanding by now and will never be answered
    tokio::time::sleep(Duration::from_millis(150)).await;
    send(
        &mut client,
        json!({ "jsonrpc": "2.0", "id": 1.5, "method": "tools/call", "params": { "name": "after_discovery" } }),
    )
    .await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["id"], 1.5);
    assert_eq!(reply["result"]["method"], "after_discovery");

    send(&mut client, json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" })).await;
    assert_eq!(expect_reply(&mut client).await["error"]["code"], -32000);

    let (_, body) = http_get(gateway.port, "/health").await.unwrap();
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["queueDepth"], 0);
    assert_eq!(health["toolsCached"], false);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_colliding_ids_route_to_their_own_clients() {
    let gateway = TestGateway::start(mock_worker_config()).await;
    gateway.wait_ready().await;

    let mut a = gateway.connect().await;
    let mut b = gateway.connect().await;

    call(&mut a, 1, "open", json!({ "from": "a" })).await;
    call(&mut b, 1, "click", json!({ "from": "b" })).await;

    let reply_a = expect_reply(&mut a).await;
    let reply_b = expect_reply(&mut b).await;

    assert_eq!(reply_a["id"], 1);
    assert_eq!(reply_a["result"]["method"], "open");
    assert_eq!(reply_a["result"]["params"]["from"], "a");
    assert_eq!(reply_b["id"], 1);
    assert_eq!(reply_b["result"]["method"], "click");
    assert_eq!(reply_b["result"]["params"]["from"], "b");

    assert!(recv(&mut a, Duration::from_millis(200)).await.is_none());
    assert!(recv(&mut b, Duration::from_millis(200)).await.is_none());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_requests_are_served_in_arrival_order() {
    let gateway = TestGateway::start(mock_worker_config()).await;
    gateway.wait_ready().await;

    let mut slow = gateway.connect().await;
    let mut fast = gateway.connect().await;

    call(&mut slow, 1, "mock.sleep", json!({ "ms": 300 })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    call(&mut fast, 2, "quick", json!({})).await;

    // The quick request waits behind the slow one
    assert!(recv(&mut fast, Duration::from_millis(150)).await.is_none());

    let reply = expect_reply(&mut slow).await;
    assert_eq!(reply["result"]["slept"], 300);
    let reply = expect_reply(&mut fast).await;
    assert_eq!(reply["result"]["method"], "quick");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_worker_crash_fails_in_flight_and_recovers() {
    let gateway = TestGateway::start(mock_worker_config()).await;
    gateway.wait_ready().await;

    let mut a = gateway.connect().await;
    let mut b = gateway.connect().await;

    call(&mut a, 1, "mock.crash", json!({})).await;
    let failure = expect_reply(&mut a).await;
    assert_eq!(failure["id"], 1);
    assert_eq!(failure["error"]["code"], -32603);
    assert_eq!(failure["error"]["data"]["originalError"], "Worker process terminated");

    // The gateway stays up and the restarted worker serves new requests
    call(&mut b, 7, "after_crash", json!({})).await;
    let reply = expect_reply(&mut b).await;
    assert_eq!(reply["id"], 7);
    assert_eq!(reply["result"]["method"], "after_crash");

    gateway.wait_ready().await;
    let snapshot = gateway.supervisor.snapshot();
    assert_eq!(snapshot.phase, WorkerPhase::Running);
    assert_eq!(snapshot.generation, 2);
    assert_eq!(snapshot.restart_attempts, 1);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_disposes_only_owned_contexts() {
    let gateway = TestGateway::start(mock_worker_config()).await;
    gateway.wait_ready().await;

    let mut a = gateway.connect().await;
    let mut b = gateway.connect().await;

    call(&mut a, 1, "browser.newContext", json!({})).await;
    let a1 = expect_reply(&mut a).await["result"]["guid"].as_str().unwrap().to_string();
    call(&mut b, 1, "browser.newContext", json!({})).await;
    let b1 = expect_reply(&mut b).await["result"]["guid"].as_str().unwrap().to_string();
    call(&mut a, 2, "browser.newContext", json!({})).await;
    let a2 = expect_reply(&mut a).await["result"]["guid"].as_str().unwrap().to_string();

    a.close(None).await.unwrap();
    drop(a);
    tokio::time::sleep(Duration::from_millis(300)).await;

    call(&mut b, 2, "mock.contexts", json!({})).await;
    let reply = expect_reply(&mut b).await;
    let contexts: Vec<String> = serde_json::from_value(reply["result"]["contexts"].clone()).unwrap();
    assert_eq!(contexts, vec![b1]);
    assert!(!contexts.contains(&a1) && !contexts.contains(&a2));

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_worker_notifications_reach_every_client() {
    let gateway = TestGateway::start(mock_worker_config()).await;
    gateway.wait_ready().await;

    let mut a = gateway.connect().await;
    let mut b = gateway.connect().await;

    call(&mut a, 1, "mock.notify", json!({ "step": 3 })).await;

    let notification = expect_reply(&mut a).await;
    assert_eq!(notification["method"], "notifications/message");
    let reply = expect_reply(&mut a).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["notified"], true);

    let notification = expect_reply(&mut b).await;
    assert_eq!(notification["method"], "notifications/message");
    assert_eq!(notification["params"]["data"]["step"], 3);
    assert!(recv(&mut b, Duration::from_millis(200)).await.is_none());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_protocol_errors_are_reported_to_sender() {
    let gateway = TestGateway::start(mock_worker_config()).await;
    let mut client = gateway.connect().await;

    client.send(Message::Text("{not json".to_string())).await.unwrap();
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["error"]["code"], -32700);
    assert_eq!(reply["id"], Value::Null);

    send(&mut client, json!({ "jsonrpc": "2.0", "id": 2, "method": "resources/list" })).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["id"], 2);
    assert_eq!(reply["error"]["code"], -32601);
    assert!(reply["error"]["message"].as_str().unwrap().contains("resources/list"));

    send(&mut client, json!({ "jsonrpc": "2.0", "id": 3, "method": "tools/call", "params": {} })).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["error"]["code"], -32602);

    // Worker errors are passed through untouched
    gateway.wait_ready().await;
    call(&mut client, 4, "mock.fail", json!({})).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["id"], 4);
    assert_eq!(reply["error"]["message"], "requested failure");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_health_and_version_endpoints() {
    let gateway = TestGateway::start(mock_worker_config()).await;
    gateway.wait_ready().await;

    let (status, body) = http_get(gateway.port, "/health").await.unwrap();
    assert_eq!(status, 200);
    let health: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["workerAlive"], true);
    assert_eq!(health["workerResponsive"], true);
    assert_eq!(health["workerState"], "running");
    assert!(health["uptimeSeconds"].is_number());

    let (status, body) = http_get(gateway.port, "/version").await.unwrap();
    assert_eq!(status, 200);
    let version: Value = serde_json::from_str(&body).unwrap();
    assert_eq!(version["name"], "toolgate");

    let (status, _) = http_get(gateway.port, "/nope").await.unwrap();
    assert_eq!(status, 404);

    gateway.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn test_exhausted_restart_budget_degrades_gateway() {
    let mut worker = WorkerConfig::local("false");
    worker.max_restarts = 2;
    worker.restart_backoff_ms = 10;
    let gateway = TestGateway::start(worker).await;

    let mut degraded = None;
    for _ in 0..100 {
        let (status, body) = http_get(gateway.port, "/health").await.unwrap();
        let health: Value = serde_json::from_str(&body).unwrap();
        if status == 503 && health["workerState"] == "exited" && health["restartAttempts"] == 2 {
            degraded = Some(health);
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    let health = degraded.expect("gateway should report degraded health");
    assert_eq!(health["status"], "degraded");
    assert_eq!(health["workerAlive"], false);

    // No further spawn attempts
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.supervisor.snapshot().generation, 3);

    let mut client = gateway.connect().await;
    call(&mut client, 1, "anything", json!({})).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["error"]["code"], -32001);

    send(&mut client, json!({ "jsonrpc": "2.0", "id": 2, "method": "initialize" })).await;
    let reply = expect_reply(&mut client).await;
    assert!(reply["result"]["serverInfo"].is_object());

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_queue_depth_limit_rejects_overflow() {
    let mut config = Config::default();
    config.worker = mock_worker_config();
    config.queue.max_depth = Some(1);
    let gateway = TestGateway::start_with_config(config).await;
    gateway.wait_ready().await;

    let mut client = gateway.connect().await;
    call(&mut client, 1, "mock.sleep", json!({ "ms": 300 })).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    call(&mut client, 2, "queued", json!({})).await;
    call(&mut client, 3, "overflow", json!({})).await;

    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["id"], 3);
    assert_eq!(reply["error"]["code"], -32002);

    assert_eq!(expect_reply(&mut client).await["id"], 1);
    assert_eq!(expect_reply(&mut client).await["id"], 2);

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_request_timeout_kills_stuck_worker() {
    let mut worker = mock_worker_config();
    worker.request_timeout_ms = Some(200);
    let gateway = TestGateway::start(worker).await;
    gateway.wait_ready().await;

    let mut client = gateway.connect().await;
    call(&mut client, 1, "mock.sleep", json!({ "ms": 10_000 })).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["error"]["code"], -32603);

    call(&mut client, 2, "after_timeout", json!({})).await;
    let reply = expect_reply(&mut client).await;
    assert_eq!(reply["result"]["method"], "after_timeout");

    gateway.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_closes_client_sessions() {
    let gateway = TestGateway::start(mock_worker_config()).await;
    let mut client = gateway.connect().await;

    let _ = gateway.shutdown_tx.send(true);

    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match client.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(closed);

    gateway.supervisor.stop().await;
    assert_eq!(gateway.supervisor.snapshot().phase, WorkerPhase::Stopped);
}
