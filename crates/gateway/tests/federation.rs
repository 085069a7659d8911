//! End-to-end federation tests over real HTTP.
//!
//! A gateway with scripted backends is served on an ephemeral port and
//! exercised with a plain HTTP client, including the client SSE streams.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    futures::StreamExt,
    tokio::io::{AsyncBufReadExt, BufReader, Lines},
    tokio::net::TcpListener,
};

use junction_adapter::testing::{ScriptedTransport, scripted_adapter};
use junction_adapter::BackendConfig;
use junction_gateway::{AppState, Gateway, SessionManager, build_app};
use junction_registry::Registry;

struct TestGateway {
    addr: SocketAddr,
    registry: Arc<Registry>,
    fakes: Vec<Arc<ScriptedTransport>>,
}

impl TestGateway {
    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }
}

/// Spin up a gateway with one scripted backend per id on an ephemeral port.
async fn start_test_gateway(backend_ids: &[&str]) -> TestGateway {
    let registry = Arc::new(Registry::new());
    let mut fakes = Vec::new();
    for id in backend_ids {
        let (adapter, fake) = scripted_adapter(BackendConfig {
            id: (*id).into(),
            command: Some("unused".into()),
            ..Default::default()
        });
        fake.advertise_tools(serde_json::json!([
            {"name": "read_file", "inputSchema": {"type": "object"}}
        ]));
        adapter.start().await.unwrap();
        registry.insert_for_tests(adapter).await;
        fakes.push(fake);
    }

    let sessions = Arc::new(SessionManager::new(Duration::from_secs(300)));
    let gateway = Arc::new(Gateway::new(Arc::clone(&registry), Arc::clone(&sessions)));
    let app = build_app(AppState {
        gateway,
        registry: Arc::clone(&registry),
        sessions,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestGateway {
        addr,
        registry,
        fakes,
    }
}

async fn rpc(
    client: &reqwest::Client,
    url: &str,
    body: serde_json::Value,
) -> serde_json::Value {
    client
        .post(url)
        .header("Content-Type", "application/json")
        .body(body.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

// ── SSE client helpers ───────────────────────────────────────────────

type EventLines = Lines<BufReader<std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>>>>;

/// Open the event-stream endpoint and return a line reader over it.
async fn open_event_stream(client: &reqwest::Client, url: &str) -> EventLines {
    let resp = client.get(url).send().await.unwrap();
    assert!(resp.status().is_success());
    assert!(
        resp.headers()["content-type"]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let stream = resp
        .bytes_stream()
        .map(|item| item.map_err(std::io::Error::other));
    let reader: std::pin::Pin<Box<dyn tokio::io::AsyncRead + Send>> =
        Box::pin(tokio_util::io::StreamReader::new(stream));
    BufReader::new(reader).lines()
}

/// Read the next non-comment SSE event as (event, data).
async fn next_event(lines: &mut EventLines) -> (String, String) {
    let mut event = String::from("message");
    let mut data = Vec::new();
    loop {
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .expect("timed out reading event stream")
            .unwrap()
            .expect("event stream ended");
        if line.is_empty() {
            if data.is_empty() {
                continue;
            }
            return (event, data.join("\n"));
        }
        if line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            event = rest.trim().to_string();
        } else if let Some(rest) = line.strip_prefix("data:") {
            data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
}

// ── Scenarios ────────────────────────────────────────────────────────

#[tokio::test]
async fn health_endpoint_returns_json() {
    let gw = start_test_gateway(&[]).await;
    let resp = reqwest::get(gw.url("/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn status_reports_backend_health_and_breaker() {
    let gw = start_test_gateway(&["fs"]).await;
    let resp = reqwest::get(gw.url("/status")).await.unwrap();
    let body: serde_json::Value = resp.json().await.unwrap();

    let backends = body["backends"].as_array().unwrap();
    assert_eq!(backends.len(), 1);
    assert_eq!(backends[0]["id"], "fs");
    assert_eq!(backends[0]["health"], "healthy");
    assert_eq!(backends[0]["circuit"]["state"], "closed");
    assert!(backends[0]["stats"]["total_requests"].as_u64().unwrap() >= 1);
}

#[tokio::test]
async fn tools_list_and_call_round_trip() {
    let gw = start_test_gateway(&["fs"]).await;
    gw.fakes[0].set_reply(
        "tools/call",
        serde_json::json!({"content": [{"type": "text", "text": "data"}]}),
    );
    let client = reqwest::Client::new();

    // The catalog carries exactly the namespaced tool.
    let listed = rpc(
        &client,
        &gw.url("/rpc"),
        serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list"}),
    )
    .await;
    let tools = listed["result"]["tools"].as_array().unwrap();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0]["name"], "fs__read_file");

    // Calling it reaches the backend with the unprefixed name.
    let called = rpc(
        &client,
        &gw.url("/rpc"),
        serde_json::json!({
            "jsonrpc": "2.0", "id": 2, "method": "tools/call",
            "params": {"name": "fs__read_file", "arguments": {"path": "/a"}}
        }),
    )
    .await;
    assert_eq!(called["id"], 2);
    assert_eq!(called["result"]["content"][0]["text"], "data");

    let outbound = gw.fakes[0]
        .sent_frames()
        .into_iter()
        .find(|f| f.get("method").and_then(|m| m.as_str()) == Some("tools/call"))
        .unwrap();
    assert_eq!(outbound["params"]["name"], "read_file");
    assert_eq!(outbound["params"]["arguments"]["path"], "/a");
}

#[tokio::test]
async fn unknown_backend_returns_backend_unavailable_with_echoed_id() {
    let gw = start_test_gateway(&["fs"]).await;
    let client = reqwest::Client::new();

    let resp = rpc(
        &client,
        &gw.url("/rpc"),
        serde_json::json!({
            "jsonrpc": "2.0", "id": "req-17", "method": "tools/call",
            "params": {"name": "missing__x"}
        }),
    )
    .await;
    assert_eq!(resp["id"], "req-17");
    assert_eq!(resp["error"]["code"], -32000);
}

#[tokio::test]
async fn backend_error_object_is_relayed_unchanged() {
    let gw = start_test_gateway(&["sse1"]).await;
    gw.fakes[0].set_error_reply("prompts/get", -32001, "nope");
    let client = reqwest::Client::new();

    let resp = rpc(
        &client,
        &gw.url("/rpc"),
        serde_json::json!({
            "jsonrpc": "2.0", "id": 5, "method": "prompts/get",
            "params": {"name": "sse1__greet"}
        }),
    )
    .await;
    assert_eq!(resp["id"], 5);
    assert_eq!(resp["error"]["code"], -32001);
    assert_eq!(resp["error"]["message"], "nope");
}

#[tokio::test]
async fn terminally_unhealthy_backend_is_refused() {
    let gw = start_test_gateway(&["crashy"]).await;
    gw.registry.get("crashy").await.unwrap().mark_unhealthy();
    let client = reqwest::Client::new();

    let resp = rpc(
        &client,
        &gw.url("/rpc"),
        serde_json::json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "crashy__read_file"}
        }),
    )
    .await;
    assert_eq!(resp["error"]["code"], -32000);
}

#[tokio::test]
async fn each_client_stream_receives_only_its_own_replies() {
    let gw = start_test_gateway(&[]).await;
    let client = reqwest::Client::new();

    // Two clients open event streams; each learns its own session id.
    let mut stream_a = open_event_stream(&client, &gw.url("/sse")).await;
    let mut stream_b = open_event_stream(&client, &gw.url("/sse")).await;

    let (event_a, data_a) = next_event(&mut stream_a).await;
    let (event_b, data_b) = next_event(&mut stream_b).await;
    assert_eq!(event_a, "endpoint");
    assert_eq!(event_b, "endpoint");

    let endpoint_a: serde_json::Value = serde_json::from_str(&data_a).unwrap();
    let endpoint_b: serde_json::Value = serde_json::from_str(&data_b).unwrap();
    assert_eq!(endpoint_a["endpoint"], "/message");
    let session_a = endpoint_a["sessionId"].as_str().unwrap().to_string();
    let session_b = endpoint_b["sessionId"].as_str().unwrap().to_string();
    assert_ne!(session_a, session_b);

    // Client A initializes through the paired message endpoint.
    let http_reply: serde_json::Value = client
        .post(gw.url("/message"))
        .header("Content-Type", "application/json")
        .header("X-Session-ID", &session_a)
        .body(
            serde_json::json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}})
                .to_string(),
        )
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(http_reply["result"]["serverInfo"]["name"].is_string());

    // The same reply arrives on A's stream as a message event.
    let (event, data) = next_event(&mut stream_a).await;
    assert_eq!(event, "message");
    let mirrored: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(mirrored["id"], 1);
    assert_eq!(
        mirrored["result"]["serverInfo"]["name"],
        http_reply["result"]["serverInfo"]["name"]
    );

    // B's stream stays quiet: a ping bound to B must be its next event.
    let _ = client
        .post(gw.url("/message"))
        .header("Content-Type", "application/json")
        .header("X-Session-ID", &session_b)
        .body(serde_json::json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}).to_string())
        .send()
        .await
        .unwrap();
    let (event, data) = next_event(&mut stream_b).await;
    assert_eq!(event, "message");
    let first_for_b: serde_json::Value = serde_json::from_str(&data).unwrap();
    assert_eq!(first_for_b["id"], 2, "client B must not see client A's replies");
}

#[tokio::test]
async fn message_endpoint_with_unknown_session_still_answers() {
    let gw = start_test_gateway(&[]).await;
    let client = reqwest::Client::new();

    let resp: serde_json::Value = client
        .post(gw.url("/message"))
        .header("Content-Type", "application/json")
        .header("X-Session-ID", "not-a-session")
        .body(serde_json::json!({"jsonrpc": "2.0", "id": 9, "method": "ping"}).to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(resp["id"], 9);
    assert!(resp["result"].is_object());
}
