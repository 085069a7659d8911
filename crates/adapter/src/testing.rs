//! Scripted in-process transport for tests.
//!
//! Available to this crate's own tests and, behind the `testing` feature, to
//! downstream crates that need an adapter without a real backend.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::sync::mpsc;

use crate::{
    adapter::Adapter,
    config::BackendConfig,
    error::{Error, Result},
    transport::{Transport, TransportEvent},
};

/// A transport that answers known methods from a script, stays silent on
/// unknown ones, and lets tests emit transport events directly.
pub struct ScriptedTransport {
    events: mpsc::UnboundedSender<TransportEvent>,
    connected: AtomicBool,
    fail_start: AtomicBool,
    sent: StdMutex<Vec<serde_json::Value>>,
    replies: StdMutex<HashMap<String, serde_json::Value>>,
    error_replies: StdMutex<HashMap<String, (i64, String)>>,
}

impl ScriptedTransport {
    pub fn new(events: mpsc::UnboundedSender<TransportEvent>) -> Arc<Self> {
        let replies = HashMap::from([
            (
                "initialize".to_string(),
                serde_json::json!({
                    "protocolVersion": "2024-11-05",
                    "capabilities": {},
                    "serverInfo": {"name": "scripted", "version": "1.0"}
                }),
            ),
            ("ping".to_string(), serde_json::json!({})),
        ]);
        Arc::new(Self {
            events,
            connected: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            sent: StdMutex::new(Vec::new()),
            replies: StdMutex::new(replies),
            error_replies: StdMutex::new(HashMap::new()),
        })
    }

    pub fn set_reply(&self, method: &str, result: serde_json::Value) {
        self.replies
            .lock()
            .unwrap()
            .insert(method.to_string(), result);
    }

    pub fn set_error_reply(&self, method: &str, code: i64, message: &str) {
        self.error_replies
            .lock()
            .unwrap()
            .insert(method.to_string(), (code, message.to_string()));
    }

    /// Script an initialize that advertises tools plus the matching list.
    pub fn advertise_tools(&self, tools: serde_json::Value) {
        self.set_reply(
            "initialize",
            serde_json::json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "scripted", "version": "1.0"}
            }),
        );
        self.set_reply("tools/list", serde_json::json!({ "tools": tools }));
    }

    /// Make the next `start` fail with a spawn error.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Simulate a dead connection without emitting a close event.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Simulate an unexpected termination.
    pub fn emit_closed(&self, reason: &str) {
        self.connected.store(false, Ordering::SeqCst);
        let _ = self.events.send(TransportEvent::Closed {
            reason: reason.into(),
        });
    }

    /// Inject an inbound frame as if the backend had sent it.
    pub fn emit_frame(&self, frame: serde_json::Value) {
        let _ = self.events.send(TransportEvent::Frame(frame.to_string()));
    }

    pub fn sent_frames(&self) -> Vec<serde_json::Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_methods(&self) -> Vec<String> {
        self.sent_frames()
            .iter()
            .filter_map(|f| f.get("method").and_then(|m| m.as_str()).map(String::from))
            .collect()
    }
}

#[async_trait::async_trait]
impl Transport for ScriptedTransport {
    async fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::SpawnFailed {
                command: "scripted".into(),
                source: std::io::Error::other("scripted start failure"),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn send_raw(&self, frame: &str) -> Result<()> {
        let value: serde_json::Value = serde_json::from_str(frame).unwrap();
        self.sent.lock().unwrap().push(value.clone());

        let Some(id) = value.get("id").and_then(|v| v.as_u64()) else {
            return Ok(()); // notification
        };
        let method = value
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();

        if let Some((code, message)) = self.error_replies.lock().unwrap().get(&method) {
            self.emit_frame(serde_json::json!({
                "jsonrpc": "2.0", "id": id,
                "error": {"code": code, "message": message}
            }));
            return Ok(());
        }
        if let Some(result) = self.replies.lock().unwrap().get(&method) {
            self.emit_frame(serde_json::json!({
                "jsonrpc": "2.0", "id": id, "result": result
            }));
        }
        // Unknown methods stay silent so timeout paths can be exercised.
        Ok(())
    }
}

/// Build an adapter wired over a fresh [`ScriptedTransport`].
pub fn scripted_adapter(config: BackendConfig) -> (Arc<Adapter>, Arc<ScriptedTransport>) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let fake = ScriptedTransport::new(events_tx);
    let adapter = Adapter::with_transport(
        config,
        Arc::clone(&fake) as Arc<dyn Transport>,
        events_rx,
        None,
    );
    (adapter, fake)
}
