//! Event-stream transport: reach a remote backend over HTTP/SSE.
//!
//! The backend's stream is opened with a GET; its first `endpoint` event
//! names the HTTP endpoint (and session id) that outbound JSON-RPC is POSTed
//! to. Subsequent `message` events carry inbound JSON-RPC payloads. A 401 on
//! either leg triggers one silent token refresh and a single retry.

use std::{
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    futures::StreamExt,
    reqwest::StatusCode,
    secrecy::ExposeSecret,
    tokio::{
        io::{AsyncBufReadExt, BufReader},
        sync::{Notify, RwLock, mpsc},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::{
    config::BackendConfig,
    error::{Error, Result},
    token::TokenProvider,
    transport::{Transport, TransportEvent},
};

const ENDPOINT_WAIT: Duration = Duration::from_secs(15);

/// The message endpoint announced by the backend's `endpoint` event.
#[derive(Debug, Clone)]
struct Endpoint {
    url: Url,
    session_id: Option<String>,
}

// ── SSE framing ──────────────────────────────────────────────────────

/// One decoded server-sent event.
#[derive(Debug, PartialEq)]
struct SseEvent {
    event: String,
    data: String,
}

/// Incremental SSE decoder fed one line at a time. Emits an event on the
/// blank separator line.
#[derive(Default)]
struct SseDecoder {
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    fn push_line(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.is_empty() {
            if self.event.is_none() && self.data.is_empty() {
                return None;
            }
            let event = self.event.take().unwrap_or_else(|| "message".into());
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(SseEvent { event, data });
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
        None
    }
}

/// Parse the payload of an `endpoint` event against the stream's base URL.
fn parse_endpoint(base: &Url, data: &str) -> Option<Endpoint> {
    let trimmed = data.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let path = value.get("endpoint")?.as_str()?;
        let url = base.join(path).ok()?;
        let session_id = value
            .get("sessionId")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        return Some(Endpoint { url, session_id });
    }
    // Some backends send the endpoint as a bare URI reference.
    base.join(trimmed).ok().map(|url| Endpoint {
        url,
        session_id: None,
    })
}

// ── Transport ────────────────────────────────────────────────────────

/// SSE transport for one remote backend.
pub struct SseTransport {
    id: String,
    base_url: Url,
    http: reqwest::Client,
    token: Option<TokenProvider>,
    events: mpsc::UnboundedSender<TransportEvent>,
    endpoint: Arc<RwLock<Option<Endpoint>>>,
    endpoint_ready: Arc<Notify>,
    connected: Arc<AtomicBool>,
    cancel: StdMutex<CancellationToken>,
}

impl SseTransport {
    pub fn new(config: &BackendConfig, events: mpsc::UnboundedSender<TransportEvent>) -> Result<Self> {
        let base_url = Url::parse(config.url.as_deref().unwrap_or(""))?;
        let http = reqwest::Client::builder().build()?;
        let token = config
            .token
            .clone()
            .map(|t| TokenProvider::new(t, http.clone()));

        Ok(Self {
            id: config.id.clone(),
            base_url,
            http,
            token,
            events,
            endpoint: Arc::new(RwLock::new(None)),
            endpoint_ready: Arc::new(Notify::new()),
            connected: Arc::new(AtomicBool::new(false)),
            cancel: StdMutex::new(CancellationToken::new()),
        })
    }

    fn fresh_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        let mut slot = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
        slot.cancel();
        *slot = token.clone();
        token
    }

    fn current_cancel(&self) -> CancellationToken {
        self.cancel
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    async fn open_stream(&self) -> Result<reqwest::Response> {
        let mut attempted_refresh = false;
        loop {
            let mut req = self
                .http
                .get(self.base_url.clone())
                .header("Accept", "text/event-stream")
                .header("Cache-Control", "no-cache");
            if let Some(provider) = &self.token {
                let bearer = provider.bearer().await?;
                req = req.bearer_auth(bearer.expose_secret());
            }

            let resp = req.send().await?;
            if resp.status() == StatusCode::UNAUTHORIZED
                && !attempted_refresh
                && let Some(provider) = &self.token
            {
                debug!(backend = %self.id, "event stream rejected token, refreshing once");
                provider.invalidate().await;
                attempted_refresh = true;
                continue;
            }
            if !resp.status().is_success() {
                return Err(Error::Protocol(format!(
                    "event stream returned HTTP {}",
                    resp.status()
                )));
            }
            return Ok(resp);
        }
    }

    async fn wait_for_endpoint(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + ENDPOINT_WAIT;
        loop {
            if self.endpoint.read().await.is_some() {
                return Ok(());
            }
            let notified = self.endpoint_ready.notified();
            if self.endpoint.read().await.is_some() {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::Protocol(
                    "backend sent no endpoint event".into(),
                ));
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> Result<()> {
        info!(backend = %self.id, url = %self.base_url, "opening event stream");

        *self.endpoint.write().await = None;
        let resp = self.open_stream().await?;
        let cancel = self.fresh_cancel();
        self.connected.store(true, Ordering::SeqCst);

        let id = self.id.clone();
        let base = self.base_url.clone();
        let events = self.events.clone();
        let endpoint = Arc::clone(&self.endpoint);
        let endpoint_ready = Arc::clone(&self.endpoint_ready);
        let connected = Arc::clone(&self.connected);

        tokio::spawn(async move {
            let stream = resp
                .bytes_stream()
                .map(|item| item.map_err(std::io::Error::other));
            let reader = tokio_util::io::StreamReader::new(stream);
            let mut lines = BufReader::new(reader).lines();
            let mut decoder = SseDecoder::default();

            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let line = match line {
                            Ok(Some(line)) => line,
                            Ok(None) | Err(_) => break,
                        };
                        let Some(event) = decoder.push_line(&line) else {
                            continue;
                        };
                        match event.event.as_str() {
                            "endpoint" => {
                                if let Some(ep) = parse_endpoint(&base, &event.data) {
                                    debug!(backend = %id, endpoint = %ep.url, "endpoint memorized");
                                    *endpoint.write().await = Some(ep);
                                    endpoint_ready.notify_waiters();
                                } else {
                                    warn!(backend = %id, data = %event.data, "unparseable endpoint event");
                                }
                            }
                            "message" => {
                                if !event.data.trim().is_empty()
                                    && events.send(TransportEvent::Frame(event.data)).is_err()
                                {
                                    return;
                                }
                            }
                            other => {
                                debug!(backend = %id, event = %other, "ignoring event");
                            }
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }

            connected.store(false, Ordering::SeqCst);
            if !cancel.is_cancelled() {
                let _ = events.send(TransportEvent::Closed {
                    reason: "event stream closed".into(),
                });
            }
        });

        self.wait_for_endpoint().await.inspect_err(|_| {
            self.current_cancel().cancel();
            self.connected.store(false, Ordering::SeqCst);
        })
    }

    async fn stop(&self) {
        self.current_cancel().cancel();
        self.connected.store(false, Ordering::SeqCst);
        *self.endpoint.write().await = None;
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_raw(&self, frame: &str) -> Result<()> {
        let Some(endpoint) = self.endpoint.read().await.clone() else {
            return Err(Error::TransportLost("no message endpoint".into()));
        };

        let mut attempted_refresh = false;
        loop {
            let mut req = self
                .http
                .post(endpoint.url.clone())
                .header("Content-Type", "application/json")
                .body(frame.to_string());
            if let Some(session_id) = &endpoint.session_id {
                req = req.header("X-Session-ID", session_id);
            }
            if let Some(provider) = &self.token {
                let bearer = provider.bearer().await?;
                req = req.bearer_auth(bearer.expose_secret());
            }

            let resp = req.send().await?;
            if resp.status() == StatusCode::UNAUTHORIZED
                && !attempted_refresh
                && let Some(provider) = &self.token
            {
                debug!(backend = %self.id, "message endpoint rejected token, refreshing once");
                provider.invalidate().await;
                attempted_refresh = true;
                continue;
            }
            if !resp.status().is_success() {
                return Err(Error::Protocol(format!(
                    "message endpoint returned HTTP {}",
                    resp.status()
                )));
            }
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> BackendConfig {
        BackendConfig {
            id: "remote".into(),
            transport: crate::config::TransportKind::Sse,
            url: Some(url.into()),
            ..Default::default()
        }
    }

    #[test]
    fn decoder_emits_on_blank_line() {
        let mut decoder = SseDecoder::default();
        assert_eq!(decoder.push_line("event: endpoint"), None);
        assert_eq!(decoder.push_line("data: {\"endpoint\":\"/message\"}"), None);
        let event = decoder.push_line("").unwrap();
        assert_eq!(event.event, "endpoint");
        assert_eq!(event.data, "{\"endpoint\":\"/message\"}");
    }

    #[test]
    fn decoder_defaults_to_message_event() {
        let mut decoder = SseDecoder::default();
        decoder.push_line("data: {}");
        let event = decoder.push_line("").unwrap();
        assert_eq!(event.event, "message");
    }

    #[test]
    fn decoder_skips_comments_and_stray_blanks() {
        let mut decoder = SseDecoder::default();
        assert_eq!(decoder.push_line(": ping"), None);
        assert_eq!(decoder.push_line(""), None);
        decoder.push_line("data: x");
        assert!(decoder.push_line("").is_some());
    }

    #[test]
    fn decoder_joins_multiline_data() {
        let mut decoder = SseDecoder::default();
        decoder.push_line("data: {");
        decoder.push_line("data: }");
        let event = decoder.push_line("").unwrap();
        assert_eq!(event.data, "{\n}");
    }

    #[test]
    fn endpoint_parsing_resolves_relative_path() {
        let base = Url::parse("http://backend.example/sse").unwrap();
        let ep = parse_endpoint(&base, r#"{"endpoint":"/message","sessionId":"s-1"}"#).unwrap();
        assert_eq!(ep.url.as_str(), "http://backend.example/message");
        assert_eq!(ep.session_id.as_deref(), Some("s-1"));
    }

    #[test]
    fn endpoint_parsing_accepts_bare_uri() {
        let base = Url::parse("http://backend.example/sse").unwrap();
        let ep = parse_endpoint(&base, "http://backend.example/rpc").unwrap();
        assert_eq!(ep.url.as_str(), "http://backend.example/rpc");
        assert!(ep.session_id.is_none());
    }

    #[tokio::test]
    async fn start_memorizes_endpoint_and_delivers_messages() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sse")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(
                "event: endpoint\ndata: {\"endpoint\":\"/message\",\"sessionId\":\"abc\"}\n\n\
                 event: message\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n\n",
            )
            .create_async()
            .await;
        let post = server
            .mock("POST", "/message")
            .match_header("x-session-id", "abc")
            .match_header("content-type", "application/json")
            .with_status(202)
            .create_async()
            .await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = SseTransport::new(&config(&format!("{}/sse", server.url())), tx).unwrap();
        transport.start().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match frame {
            TransportEvent::Frame(data) => {
                assert!(data.contains("\"id\":1"));
            }
            other => panic!("expected frame, got {other:?}"),
        }

        transport
            .send_raw(r#"{"jsonrpc":"2.0","id":2,"method":"ping"}"#)
            .await
            .unwrap();
        post.assert_async().await;
    }

    #[tokio::test]
    async fn missing_endpoint_event_fails_start() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sse")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("event: message\ndata: {}\n\n")
            .create_async()
            .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = SseTransport::new(&config(&format!("{}/sse", server.url())), tx).unwrap();
        // The stream closes without an endpoint event; start must not hang
        // past its deadline. Cap the wait well below ENDPOINT_WAIT plus slack.
        let result =
            tokio::time::timeout(Duration::from_secs(30), transport.start()).await.unwrap();
        assert!(result.is_err());
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn non_success_get_fails_start() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sse")
            .with_status(503)
            .create_async()
            .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = SseTransport::new(&config(&format!("{}/sse", server.url())), tx).unwrap();
        let err = transport.start().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn send_raw_without_endpoint_fails() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = SseTransport::new(&config("http://127.0.0.1:1/sse"), tx).unwrap();
        let err = transport.send_raw("{}").await.unwrap_err();
        assert!(matches!(err, Error::TransportLost(_)));
    }

    #[tokio::test]
    async fn non_success_post_fails_request() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/sse")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body("event: endpoint\ndata: {\"endpoint\":\"/message\"}\n\n")
            .create_async()
            .await;
        server
            .mock("POST", "/message")
            .with_status(500)
            .create_async()
            .await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = SseTransport::new(&config(&format!("{}/sse", server.url())), tx).unwrap();
        transport.start().await.unwrap();
        let err = transport.send_raw("{}").await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
