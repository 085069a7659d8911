//! The MCP method dispatch facade.
//!
//! Every inbound JSON-RPC request lands in [`Gateway::handle`]: the envelope
//! is validated, the method dispatched, and the reply (with the client's id
//! echoed) returned. When the call is bound to a session, the reply is also
//! mirrored onto that session's event stream.

use std::sync::Arc;

use {
    serde_json::{Value, json},
    tokio::sync::mpsc,
    tracing::{debug, warn},
};

use junction_adapter::BackendNotification;
use junction_protocol::{
    GATEWAY_NAME, JsonRpcNotification, JsonRpcResponse, PROTOCOL_VERSION, error_codes,
};
use junction_registry::{Error as RouteError, Registry, Router, namespace_name, namespace_uri};

use crate::{session::SessionManager, sse};

pub struct Gateway {
    registry: Arc<Registry>,
    router: Router,
    sessions: Arc<SessionManager>,
}

impl Gateway {
    pub fn new(registry: Arc<Registry>, sessions: Arc<SessionManager>) -> Self {
        Self {
            router: Router::new(Arc::clone(&registry)),
            registry,
            sessions,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Handle one inbound JSON-RPC request. `session_id` is the validated id
    /// from the paired event stream, when the call is bound to one.
    pub async fn handle(&self, raw: Value, session_id: Option<&str>) -> JsonRpcResponse {
        // A missing id is treated as 0 for reply purposes.
        let id = raw
            .get("id")
            .filter(|v| !v.is_null())
            .cloned()
            .unwrap_or_else(|| json!(0));

        if let Some(sid) = session_id {
            self.sessions.touch(sid);
        }

        let response = match raw.get("method").and_then(Value::as_str) {
            Some(method) => {
                let params = raw.get("params").cloned();
                self.dispatch(method, params, id, session_id).await
            }
            None => JsonRpcResponse::error(
                id,
                error_codes::INVALID_REQUEST,
                "request has no method",
            ),
        };

        // Mirror the reply onto the bound stream; delivery silently no-ops
        // on a dead one.
        if let Some(sid) = session_id
            && let Ok(payload) = serde_json::to_string(&response)
        {
            self.sessions.send_to(sid, sse::message_event(payload));
        }

        response
    }

    async fn dispatch(
        &self,
        method: &str,
        params: Option<Value>,
        id: Value,
        session_id: Option<&str>,
    ) -> JsonRpcResponse {
        debug!(%method, session = ?session_id, "client request");
        match method {
            "initialize" => self.initialize(params, id, session_id).await,
            "ping" => JsonRpcResponse::result(id, json!({})),
            "tools/list" => self.tools_list(id).await,
            "tools/call" => self.tools_call(params, id).await,
            "resources/list" => self.resources_list(id).await,
            "resources/read" => self.resources_read(params, id).await,
            "resources/templates/list" => {
                // Resource templates are not federated.
                JsonRpcResponse::result(id, json!({ "resourceTemplates": [] }))
            }
            "prompts/list" => self.prompts_list(id).await,
            "prompts/get" => self.prompts_get(params, id).await,
            "notifications/initialized" | "notifications/cancelled" => {
                JsonRpcResponse::result(id, json!({}))
            }
            other => JsonRpcResponse::error(
                id,
                error_codes::METHOD_NOT_FOUND,
                format!("method '{other}' is not supported"),
            ),
        }
    }

    // ── MCP methods ──────────────────────────────────────────────────

    async fn initialize(
        &self,
        params: Option<Value>,
        id: Value,
        session_id: Option<&str>,
    ) -> JsonRpcResponse {
        if let Some(sid) = session_id {
            let client = params.as_ref().and_then(|p| p.get("clientInfo"));
            let name = client
                .and_then(|c| c.get("name"))
                .and_then(Value::as_str)
                .map(String::from);
            let version = client
                .and_then(|c| c.get("version"))
                .and_then(Value::as_str)
                .map(String::from);
            self.sessions.set_client_info(sid, name, version);
        }

        let merged = self.registry.merged_capabilities().await;
        let backends = self.registry.backend_ids().await;

        // Advertise only the groups some healthy backend actually offers.
        let mut capabilities = serde_json::Map::new();
        if !merged.tools.is_empty() {
            capabilities.insert("tools".into(), json!({}));
        }
        if !merged.resources.is_empty() {
            capabilities.insert("resources".into(), json!({}));
        }
        if !merged.prompts.is_empty() {
            capabilities.insert("prompts".into(), json!({}));
        }

        let instructions = format!(
            "This gateway federates {count} MCP backend(s): {ids}. \
             Tool and prompt names are prefixed '<backend>__<name>'; \
             resource URIs are prefixed '<backend>://<uri>'.",
            count = backends.len(),
            ids = if backends.is_empty() {
                "none".to_string()
            } else {
                backends.join(", ")
            },
        );

        JsonRpcResponse::result(
            id,
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": capabilities,
                "serverInfo": {
                    "name": GATEWAY_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "instructions": instructions,
            }),
        )
    }

    async fn tools_list(&self, id: Value) -> JsonRpcResponse {
        let merged = self.registry.merged_capabilities().await;
        let tools: Vec<Value> = merged
            .tools
            .into_iter()
            .map(|entry| {
                let mut tool = entry.item;
                tool.name = namespace_name(&entry.backend, &tool.name);
                serde_json::to_value(tool).unwrap_or_default()
            })
            .collect();
        JsonRpcResponse::result(id, json!({ "tools": tools }))
    }

    async fn resources_list(&self, id: Value) -> JsonRpcResponse {
        let merged = self.registry.merged_capabilities().await;
        let resources: Vec<Value> = merged
            .resources
            .into_iter()
            .map(|entry| {
                let mut resource = entry.item;
                resource.uri = namespace_uri(&entry.backend, &resource.uri);
                serde_json::to_value(resource).unwrap_or_default()
            })
            .collect();
        JsonRpcResponse::result(id, json!({ "resources": resources }))
    }

    async fn prompts_list(&self, id: Value) -> JsonRpcResponse {
        let merged = self.registry.merged_capabilities().await;
        let prompts: Vec<Value> = merged
            .prompts
            .into_iter()
            .map(|entry| {
                let mut prompt = entry.item;
                prompt.name = namespace_name(&entry.backend, &prompt.name);
                serde_json::to_value(prompt).unwrap_or_default()
            })
            .collect();
        JsonRpcResponse::result(id, json!({ "prompts": prompts }))
    }

    async fn tools_call(&self, params: Option<Value>, id: Value) -> JsonRpcResponse {
        let Some(name) = param_str(&params, "name") else {
            return missing_param(id, "name");
        };
        let arguments = params.as_ref().and_then(|p| p.get("arguments")).cloned();
        self.relay(self.router.route_tool_call(&name, arguments).await, id)
    }

    async fn resources_read(&self, params: Option<Value>, id: Value) -> JsonRpcResponse {
        let Some(uri) = param_str(&params, "uri") else {
            return missing_param(id, "uri");
        };
        self.relay(self.router.route_resource_read(&uri).await, id)
    }

    async fn prompts_get(&self, params: Option<Value>, id: Value) -> JsonRpcResponse {
        let Some(name) = param_str(&params, "name") else {
            return missing_param(id, "name");
        };
        let arguments = params.as_ref().and_then(|p| p.get("arguments")).cloned();
        self.relay(self.router.route_prompt_get(&name, arguments).await, id)
    }

    /// Return a routed backend reply verbatim with the client's id restored,
    /// or map a routing failure onto the wire error codes.
    fn relay(
        &self,
        routed: junction_registry::Result<JsonRpcResponse>,
        id: Value,
    ) -> JsonRpcResponse {
        match routed {
            Ok(mut response) => {
                response.id = id;
                response
            }
            Err(e) => route_error_response(id, e),
        }
    }

    // ── Backend notification fan-out ─────────────────────────────────

    /// Broadcast server-initiated backend notifications to every connected
    /// client stream as `message` events.
    pub fn spawn_notification_fanout(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<BackendNotification>,
    ) -> tokio::task::JoinHandle<()> {
        let gateway = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                debug!(
                    backend = %notification.backend,
                    method = %notification.method,
                    "broadcasting backend notification"
                );
                let envelope = JsonRpcNotification::new(
                    &notification.method,
                    notification.params.clone(),
                );
                let Ok(payload) = serde_json::to_string(&envelope) else {
                    continue;
                };
                gateway
                    .sessions
                    .broadcast_with(|| sse::message_event(payload.clone()));
            }
        })
    }
}

fn param_str(params: &Option<Value>, key: &str) -> Option<String> {
    params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(Value::as_str)
        .map(String::from)
}

fn missing_param(id: Value, key: &str) -> JsonRpcResponse {
    JsonRpcResponse::error(
        id,
        error_codes::INVALID_PARAMS,
        format!("missing '{key}' parameter"),
    )
}

fn route_error_response(id: Value, error: RouteError) -> JsonRpcResponse {
    use junction_adapter::Error as AdapterError;
    match error {
        RouteError::Unparseable(_) => {
            JsonRpcResponse::error(id, error_codes::INVALID_PARAMS, error.to_string())
        }
        RouteError::UnknownBackend(_) | RouteError::NotHealthy { .. } => {
            JsonRpcResponse::error(id, error_codes::BACKEND_UNAVAILABLE, error.to_string())
        }
        RouteError::Adapter(AdapterError::CircuitOpen(status)) => {
            JsonRpcResponse::error_with_data(
                id,
                error_codes::INTERNAL_ERROR,
                "circuit open",
                Some(json!({
                    "reason": "circuit open",
                    "breaker": status,
                })),
            )
        }
        RouteError::Adapter(
            e @ (AdapterError::RequestTimeout { .. }
            | AdapterError::TransportLost(_)
            | AdapterError::Stopped
            | AdapterError::SpawnFailed { .. }
            | AdapterError::HandshakeTimeout { .. }),
        ) => JsonRpcResponse::error(id, error_codes::BACKEND_UNAVAILABLE, e.to_string()),
        other => {
            warn!(error = %other, "routing failed");
            JsonRpcResponse::error(id, error_codes::INTERNAL_ERROR, other.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use junction_adapter::testing::scripted_adapter;
    use junction_adapter::{BackendConfig, Health};

    async fn gateway_with_backends(
        backends: &[(&str, serde_json::Value)],
    ) -> (
        Arc<Gateway>,
        Arc<Registry>,
        Vec<Arc<junction_adapter::testing::ScriptedTransport>>,
    ) {
        let registry = Arc::new(Registry::new());
        let mut fakes = Vec::new();
        for (id, tools) in backends {
            let (adapter, fake) = scripted_adapter(BackendConfig {
                id: (*id).into(),
                command: Some("unused".into()),
                ..Default::default()
            });
            fake.advertise_tools(tools.clone());
            adapter.start().await.unwrap();
            registry.insert_for_tests(adapter).await;
            fakes.push(fake);
        }
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(300)));
        let gateway = Arc::new(Gateway::new(Arc::clone(&registry), sessions));
        (gateway, registry, fakes)
    }

    fn request(id: u64, method: &str, params: Value) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params})
    }

    #[tokio::test]
    async fn tools_list_returns_namespaced_names() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[(
            "fs",
            json!([{"name": "read_file", "inputSchema": {"type": "object"}}]),
        )])
        .await;

        let resp = gateway
            .handle(request(1, "tools/list", json!({})), None)
            .await;
        let tools = resp.result.unwrap()["tools"].clone();
        assert_eq!(tools.as_array().unwrap().len(), 1);
        assert_eq!(tools[0]["name"], "fs__read_file");
        // No origin-tracking fields leak to the client.
        assert!(tools[0].get("backend").is_none());
    }

    #[tokio::test]
    async fn tools_call_forwards_unprefixed_name() {
        let (gateway, _registry, fakes) = gateway_with_backends(&[(
            "fs",
            json!([{"name": "read_file", "inputSchema": {"type": "object"}}]),
        )])
        .await;
        fakes[0].set_reply("tools/call", json!({"content": []}));

        let resp = gateway
            .handle(
                request(7, "tools/call", json!({"name": "fs__read_file", "arguments": {"path": "/a"}})),
                None,
            )
            .await;
        assert!(resp.error.is_none());
        assert_eq!(resp.id, json!(7));

        let call = fakes[0]
            .sent_frames()
            .into_iter()
            .find(|f| f.get("method").and_then(Value::as_str) == Some("tools/call"))
            .unwrap();
        assert_eq!(call["params"]["name"], "read_file");
        assert_eq!(call["params"]["arguments"]["path"], "/a");
    }

    #[tokio::test]
    async fn unknown_backend_maps_to_backend_unavailable() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[]).await;
        let resp = gateway
            .handle(request(3, "tools/call", json!({"name": "missing__x"})), None)
            .await;
        let err = resp.error.unwrap();
        assert_eq!(err.code, error_codes::BACKEND_UNAVAILABLE);
        assert_eq!(resp.id, json!(3));
    }

    #[tokio::test]
    async fn backend_error_object_is_relayed_with_client_id() {
        let (gateway, _registry, fakes) =
            gateway_with_backends(&[("sse1", json!([]))]).await;
        fakes[0].set_error_reply("prompts/get", -32001, "nope");

        let resp = gateway
            .handle(request(42, "prompts/get", json!({"name": "sse1__greet"})), None)
            .await;
        assert_eq!(resp.id, json!(42));
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32001);
        assert_eq!(err.message, "nope");
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[]).await;
        let resp = gateway
            .handle(request(1, "sampling/createMessage", json!({})), None)
            .await;
        assert_eq!(resp.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_method_is_invalid_request() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[]).await;
        let resp = gateway.handle(json!({"jsonrpc": "2.0", "id": 5}), None).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
        assert_eq!(resp.id, json!(5));
    }

    #[tokio::test]
    async fn missing_id_is_echoed_as_zero() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[]).await;
        let resp = gateway
            .handle(json!({"jsonrpc": "2.0", "method": "ping"}), None)
            .await;
        assert_eq!(resp.id, json!(0));
        assert!(resp.result.is_some());
    }

    #[tokio::test]
    async fn missing_name_param_is_invalid_params() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[]).await;
        let resp = gateway
            .handle(request(2, "tools/call", json!({})), None)
            .await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn initialize_advertises_only_populated_groups() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[(
            "fs",
            json!([{"name": "read_file", "inputSchema": {}}]),
        )])
        .await;

        let resp = gateway
            .handle(request(1, "initialize", json!({})), None)
            .await;
        let result = resp.result.unwrap();
        assert!(result["capabilities"].get("tools").is_some());
        assert!(result["capabilities"].get("resources").is_none());
        assert!(result["capabilities"].get("prompts").is_none());
        assert_eq!(result["serverInfo"]["name"], GATEWAY_NAME);
        let instructions = result["instructions"].as_str().unwrap();
        assert!(instructions.contains("fs"));
        assert!(instructions.contains("__"));
    }

    #[tokio::test]
    async fn unhealthy_backend_excluded_from_lists_and_refused_on_call() {
        let (gateway, registry, _fakes) = gateway_with_backends(&[(
            "fs",
            json!([{"name": "read_file", "inputSchema": {}}]),
        )])
        .await;
        registry.get("fs").await.unwrap().mark_unhealthy();
        assert_eq!(registry.get("fs").await.unwrap().health(), Health::Unhealthy);

        let resp = gateway
            .handle(request(1, "tools/list", json!({})), None)
            .await;
        assert!(resp.result.unwrap()["tools"].as_array().unwrap().is_empty());

        let resp = gateway
            .handle(request(2, "tools/call", json!({"name": "fs__read_file"})), None)
            .await;
        assert_eq!(resp.error.unwrap().code, error_codes::BACKEND_UNAVAILABLE);
    }

    #[tokio::test]
    async fn resources_templates_list_is_empty() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[]).await;
        let resp = gateway
            .handle(request(1, "resources/templates/list", json!({})), None)
            .await;
        assert!(
            resp.result.unwrap()["resourceTemplates"]
                .as_array()
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn session_bound_reply_is_mirrored_on_its_stream_only() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[]).await;
        let sessions = Arc::clone(gateway.sessions());

        let (tx_a, mut rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = tokio::sync::mpsc::unbounded_channel();
        let a = sessions.create(tx_a);
        let _b = sessions.create(tx_b);

        let resp = gateway
            .handle(request(9, "ping", json!({})), Some(&a))
            .await;
        assert!(resp.result.is_some());

        assert!(rx_a.try_recv().is_ok(), "bound stream must see the reply");
        assert!(rx_b.try_recv().is_err(), "other streams must not");
    }

    #[tokio::test]
    async fn initialize_records_client_info_on_the_session() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[]).await;
        let sessions = Arc::clone(gateway.sessions());
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let sid = sessions.create(tx);

        gateway
            .handle(
                request(
                    1,
                    "initialize",
                    json!({"clientInfo": {"name": "inspector", "version": "2.1"}}),
                ),
                Some(&sid),
            )
            .await;

        let (name, version) = sessions.client_info(&sid).unwrap();
        assert_eq!(name.as_deref(), Some("inspector"));
        assert_eq!(version.as_deref(), Some("2.1"));
    }

    #[tokio::test]
    async fn notifications_are_acknowledged() {
        let (gateway, _registry, _fakes) = gateway_with_backends(&[]).await;
        for method in ["notifications/initialized", "notifications/cancelled"] {
            let resp = gateway.handle(request(1, method, json!({})), None).await;
            assert!(resp.result.is_some(), "{method} must be acknowledged");
        }
    }

    #[tokio::test]
    async fn backend_notifications_are_broadcast() {
        let (gateway, registry, fakes) =
            gateway_with_backends(&[("fs", json!([]))]).await;
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        // Wire the adapter's slot straight into the fan-out.
        registry
            .get("fs")
            .await
            .unwrap()
            .set_notification_sender(tx);
        gateway.spawn_notification_fanout(rx);

        let sessions = Arc::clone(gateway.sessions());
        let (client_tx, mut client_rx) = tokio::sync::mpsc::unbounded_channel();
        sessions.create(client_tx);

        fakes[0].emit_frame(json!({
            "jsonrpc": "2.0",
            "method": "notifications/tools/list_changed"
        }));

        let event = tokio::time::timeout(Duration::from_secs(2), client_rx.recv())
            .await
            .expect("timed out")
            .expect("stream closed");
        let _ = event;
    }
}
