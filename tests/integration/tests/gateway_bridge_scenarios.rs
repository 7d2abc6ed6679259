//! End-to-end gateway scenarios against the fake stdio backend binary.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use relay_gateway::{start_gateway_server, GatewayServerConfig, GatewayServerHandle};
use relay_registry::{ServiceDescriptor, ServiceRegistry};
use relay_runtime::{
    AutoLoginConfig, BridgeError, FanOutConfig, ProcessPool, ProcessPoolConfig, RequestBridge,
    ServiceKeyResolver, StreamFanOutPool,
};
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tokio::sync::mpsc;

const TOKEN: &str = "integration-secret";
const FAKE_BACKEND: &str = env!("CARGO_BIN_EXE_fake_stdio_backend");

struct Harness {
    dir: TempDir,
    handle: GatewayServerHandle,
    client: Client,
}

impl Harness {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.handle.local_addr())
    }

    fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    async fn register(&self, descriptor: Value) -> reqwest::Response {
        self.client
            .post(self.url("/services"))
            .bearer_auth(TOKEN)
            .json(&descriptor)
            .send()
            .await
            .expect("send register")
    }

    async fn call(&self, service_id: &str, payload: Value) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/mcp/{service_id}")))
            .bearer_auth(TOKEN)
            .json(&payload)
            .send()
            .await
            .expect("send mcp request")
    }

    async fn status(&self) -> Value {
        self.client
            .get(self.url("/gateway/status"))
            .bearer_auth(TOKEN)
            .send()
            .await
            .expect("send status")
            .json::<Value>()
            .await
            .expect("status json")
    }
}

fn base_config(services_file: &Path) -> GatewayServerConfig {
    let mut config = GatewayServerConfig::new("127.0.0.1:0", services_file);
    config.auth_token = Some(TOKEN.to_string());
    config.request_timeout = Duration::from_secs(5);
    config.pool.startup_timeout = Duration::from_secs(5);
    config
}

async fn start_harness(configure: impl FnOnce(&Path, &mut GatewayServerConfig)) -> Harness {
    let dir = tempdir().expect("tempdir");
    let services_file = dir.path().join("services.json");
    let mut config = base_config(&services_file);
    configure(dir.path(), &mut config);
    let handle = start_gateway_server(config).await.expect("start gateway");
    Harness {
        dir,
        handle,
        client: Client::new(),
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn fake_service(id: &str, script_name: &str, env: Value) -> Value {
    json!({"id": id, "command": [FAKE_BACKEND, script_name], "env": env})
}

#[tokio::test]
async fn integration_ping_is_forwarded_as_tools_call_envelope() {
    let harness = start_harness(|_, _| {}).await;
    let record = harness.file("record.log");
    let response = harness
        .register(fake_service(
            "echo",
            "echo.js",
            json!({"FAKE_BACKEND_RECORD": record.display().to_string()}),
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = harness
        .call("echo", json!({"method": "ping", "params": {}}))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.json::<Value>().await.expect("json body");
    assert_eq!(body["id"], 1);
    assert_eq!(body["result"]["content"][0]["text"], "pong");

    let lines = read_lines(&record);
    assert_eq!(
        lines.last().map(String::as_str),
        Some(r#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"ping","arguments":{}}}"#)
    );
    assert!(lines[0].contains("\"method\":\"initialize\""));

    harness.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_recognized_methods_are_forwarded_unchanged() {
    let harness = start_harness(|_, _| {}).await;
    let record = harness.file("record.log");
    harness
        .register(fake_service(
            "echo",
            "echo.js",
            json!({"FAKE_BACKEND_RECORD": record.display().to_string()}),
        ))
        .await;

    let raw = r#"{"jsonrpc":"2.0","id":"list-1","method":"tools/list","params":{"cursor":null}}"#;
    let response = harness
        .client
        .post(harness.url("/mcp/echo"))
        .bearer_auth(TOKEN)
        .header("content-type", "application/json")
        .body(raw)
        .send()
        .await
        .expect("send request");
    let body = response.json::<Value>().await.expect("json body");
    assert_eq!(body["id"], "list-1");
    assert!(body["result"]["tools"].is_array());
    assert_eq!(read_lines(&record).last().map(String::as_str), Some(raw));

    harness.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_sequential_and_concurrent_requests_share_one_process() {
    let harness = start_harness(|_, _| {}).await;
    let pids = harness.file("pids.log");
    harness
        .register(fake_service(
            "echo",
            "echo.js",
            json!({"FAKE_BACKEND_PID_FILE": pids.display().to_string()}),
        ))
        .await;

    let (first, second) = tokio::join!(
        harness.call("echo", json!({"id": 1, "method": "ping"})),
        harness.call("echo", json!({"id": 2, "method": "ping"})),
    );
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);
    let third = harness.call("echo", json!({"id": 3, "method": "ping"})).await;
    let body = third.json::<Value>().await.expect("json body");
    assert_eq!(body["id"], 3);

    assert_eq!(read_lines(&pids).len(), 1);
    let status = harness.status().await;
    assert_eq!(status["spawn_count"], 1);
    assert_eq!(status["requests"]["echo"]["requests_total"], 3);
    assert_eq!(harness.handle.live_processes(), 1);

    harness.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_timeout_keeps_backend_registered_and_reusable() {
    let harness = start_harness(|_, config| {
        config.request_timeout = Duration::from_millis(400);
    })
    .await;
    harness
        .register(fake_service("echo", "echo.js", json!({})))
        .await;

    let response = harness
        .call("echo", json!({"id": 10, "method": "silent"}))
        .await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.json::<Value>().await.expect("json body");
    assert_eq!(body["error"], "request_timeout");
    assert_eq!(harness.handle.live_processes(), 1);

    let response = harness.call("echo", json!({"id": 11, "method": "ping"})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.json::<Value>().await.expect("json body");
    assert_eq!(body["id"], 11);

    let status = harness.status().await;
    assert_eq!(status["spawn_count"], 1);
    assert_eq!(status["requests"]["echo"]["failures_total"], 1);
    assert_eq!(status["requests"]["echo"]["last_error_code"], "request_timeout");

    harness.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_unsafe_commands_never_spawn() {
    let harness = start_harness(|_, _| {}).await;
    for command in [
        json!([FAKE_BACKEND, "a;b"]),
        json!([FAKE_BACKEND, "x", "&&", "y"]),
        json!([FAKE_BACKEND, "x||y"]),
    ] {
        let response = harness.register(json!({"id": "evil", "command": command})).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
    assert_eq!(harness.status().await["spawn_count"], 0);
    harness.handle.shutdown().await.expect("shutdown");

    let bridge = RequestBridge::new(
        ProcessPool::new(ProcessPoolConfig::default()),
        ServiceKeyResolver::default(),
        Duration::from_secs(1),
    );
    let descriptor = ServiceDescriptor::new(
        "evil",
        vec![FAKE_BACKEND.to_string(), "ok".to_string(), "&&".to_string()],
    );
    let error = bridge
        .send(&descriptor, json!({"method": "ping"}))
        .await
        .expect_err("unsafe command");
    assert!(matches!(error, BridgeError::InvalidCommand(_)));
    assert_eq!(bridge.pool().spawn_count(), 0);
}

#[tokio::test]
async fn integration_stream_client_receives_heartbeat() {
    let harness = start_harness(|_, config| {
        config.fanout = FanOutConfig {
            heartbeat_interval: Duration::from_millis(100),
        };
    })
    .await;

    let response = harness
        .client
        .get(harness.url("/sse/c1"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .expect("open stream");
    assert_eq!(response.status(), StatusCode::OK);
    let mut stream = response.bytes_stream();
    let mut received = String::new();
    while !received.contains("\"type\":\"heartbeat\"") {
        let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("heartbeat in time")
            .expect("stream open")
            .expect("chunk bytes");
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(received.contains("\"type\":\"connected\""));
    assert_eq!(harness.handle.open_connections(), 1);

    drop(stream);
    harness.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_backend_notifications_are_broadcast_to_streams() {
    let harness = start_harness(|_, _| {}).await;
    harness
        .register(fake_service("echo", "echo.js", json!({})))
        .await;

    let response = harness
        .client
        .get(harness.url("/sse/watcher"))
        .bearer_auth(TOKEN)
        .send()
        .await
        .expect("open stream");
    let mut stream = response.bytes_stream();

    let reply = harness
        .call("echo", json!({"id": 4, "method": "notify_then_reply"}))
        .await
        .json::<Value>()
        .await
        .expect("json body");
    assert_eq!(reply["id"], 4);
    assert_eq!(reply["result"]["content"][0]["text"], "done");

    let mut received = String::new();
    while !received.contains("notifications/progress") {
        let chunk = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("notification in time")
            .expect("stream open")
            .expect("chunk bytes");
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(received.contains("\"service\":\"echo.js\""));

    drop(stream);
    harness.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_banner_lines_and_pretty_printed_replies_are_tolerated() {
    let harness = start_harness(|_, _| {}).await;
    harness
        .register(fake_service(
            "echo",
            "echo.js",
            json!({"FAKE_BACKEND_BANNER": "booting fake backend"}),
        ))
        .await;

    let response = harness.call("echo", json!({"id": 8, "method": "pretty"})).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.json::<Value>().await.expect("json body");
    assert_eq!(body["id"], 8);
    assert_eq!(body["result"]["content"][0]["text"], "pretty");

    harness.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_backend_exit_during_startup_is_service_unavailable() {
    let harness = start_harness(|_, _| {}).await;
    harness
        .register(fake_service(
            "broken",
            "broken.js",
            json!({"FAKE_BACKEND_EXIT_CODE": "3"}),
        ))
        .await;

    let response = harness.call("broken", json!({"method": "ping"})).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.json::<Value>().await.expect("json body");
    assert_eq!(body["error"], "service_unavailable");
    assert_eq!(harness.handle.live_processes(), 0);

    harness.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_idle_backend_is_evicted_and_respawned_on_demand() {
    let harness = start_harness(|_, config| {
        config.pool.idle_timeout = Duration::from_millis(150);
        config.pool.idle_sweep_interval = Duration::from_millis(50);
    })
    .await;
    let pids = harness.file("pids.log");
    harness
        .register(fake_service(
            "echo",
            "echo.js",
            json!({"FAKE_BACKEND_PID_FILE": pids.display().to_string()}),
        ))
        .await;

    harness.call("echo", json!({"method": "ping"})).await;
    assert_eq!(harness.handle.live_processes(), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while harness.handle.live_processes() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "idle backend was not evicted");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let response = harness.call("echo", json!({"method": "ping"})).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(read_lines(&pids).len(), 2);

    harness.handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_auto_login_runs_before_designated_service_traffic() {
    let dir = tempdir().expect("tempdir");
    let services_file = dir.path().join("services.json");
    let record = dir.path().join("affine.log");
    let registry = ServiceRegistry::load(&services_file).expect("load registry");
    registry
        .register(
            ServiceDescriptor::new(
                "affine",
                vec![FAKE_BACKEND.to_string(), "affine-mcp".to_string()],
            )
            .with_env("FAKE_BACKEND_RECORD", record.display().to_string()),
        )
        .expect("register affine");
    drop(registry);

    let mut config = base_config(&services_file);
    config.auto_login = AutoLoginConfig::new("affine")
        .with_credentials("user@example.com", "pw")
        .with_settle_delay(Duration::from_millis(50));
    let handle = start_gateway_server(config).await.expect("start gateway");
    let client = Client::new();

    let response = client
        .post(format!("http://{}/mcp/affine", handle.local_addr()))
        .bearer_auth(TOKEN)
        .json(&json!({"id": 2, "method": "ping"}))
        .send()
        .await
        .expect("send request");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(handle.wait_for_bootstrap(Duration::from_millis(10)).await);

    let lines = read_lines(&record);
    let sign_in = lines
        .iter()
        .position(|line| line.contains("\"name\":\"sign_in\""))
        .expect("sign-in call recorded");
    let ping = lines
        .iter()
        .position(|line| line.contains("\"name\":\"ping\""))
        .expect("ping call recorded");
    assert!(sign_in < ping);
    assert_eq!(
        lines
            .iter()
            .filter(|line| line.contains("\"method\":\"initialize\""))
            .count(),
        1
    );

    handle.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn integration_broadcast_skips_and_reaps_dead_stream() {
    let pool = StreamFanOutPool::new(FanOutConfig::default());
    let mut receivers = Vec::new();
    for client_id in ["a", "b", "c"] {
        let (tx, rx) = mpsc::unbounded_channel();
        pool.register(client_id, tx);
        receivers.push(rx);
    }
    drop(receivers.remove(1));

    let report = pool.broadcast(&json!({"type": "notice"}));
    assert_eq!(report.delivered, 2);
    assert_eq!(report.removed, 1);
    assert_eq!(pool.connection_count(), 2);
    assert!(!pool.contains("b"));
    pool.shutdown();
}
