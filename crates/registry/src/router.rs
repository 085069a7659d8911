//! Namespacing and dispatch.
//!
//! Tools and prompts are namespaced `<backendId>__<name>`; resources are
//! namespaced `<backendId>://<original-uri>`. Decoding takes the outermost
//! prefix exactly once; the remainder is forwarded verbatim, so original
//! URIs that themselves look like `scheme://...` round-trip safely.

use std::sync::Arc;

use junction_adapter::{Health, config::is_valid_backend_id};
use junction_protocol::JsonRpcResponse;

use crate::{
    error::{Error, Result},
    registry::Registry,
};

/// Reserved separator for tool and prompt names.
pub const NAME_SEPARATOR: &str = "__";
/// Reserved scheme separator for resource URIs.
pub const URI_SEPARATOR: &str = "://";

/// `<backend>__<name>`
pub fn namespace_name(backend: &str, name: &str) -> String {
    format!("{backend}{NAME_SEPARATOR}{name}")
}

/// `<backend>://<uri>`
pub fn namespace_uri(backend: &str, uri: &str) -> String {
    format!("{backend}{URI_SEPARATOR}{uri}")
}

/// Split a namespaced name into (backend, original). `None` when the
/// separator is absent or either half is empty.
pub fn split_name(namespaced: &str) -> Option<(&str, &str)> {
    let (backend, original) = namespaced.split_once(NAME_SEPARATOR)?;
    if backend.is_empty() || original.is_empty() || !is_valid_backend_id(backend) {
        return None;
    }
    Some((backend, original))
}

/// Split a namespaced URI into (backend, original). The backend half must
/// match the identifier pattern (letter-led); the original is untouched.
pub fn split_uri(namespaced: &str) -> Option<(&str, &str)> {
    let (backend, original) = namespaced.split_once(URI_SEPARATOR)?;
    if original.is_empty() || !is_valid_backend_id(backend) {
        return None;
    }
    Some((backend, original))
}

/// Forwards namespaced tool/resource/prompt calls to the owning adapter.
pub struct Router {
    registry: Arc<Registry>,
}

impl Router {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Call `tools/call` on the backend that owns the namespaced tool name,
    /// forwarding the original (unprefixed) name and arguments verbatim.
    pub async fn route_tool_call(
        &self,
        namespaced: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse> {
        let (backend, original) = split_name(namespaced)
            .ok_or_else(|| Error::Unparseable(namespaced.to_string()))?;
        let adapter = self.healthy_adapter(backend).await?;

        let mut params = serde_json::json!({ "name": original });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        Ok(adapter.request("tools/call", Some(params)).await?)
    }

    /// Read a namespaced resource URI from its backend.
    pub async fn route_resource_read(&self, namespaced: &str) -> Result<JsonRpcResponse> {
        let (backend, original) = split_uri(namespaced)
            .ok_or_else(|| Error::Unparseable(namespaced.to_string()))?;
        let adapter = self.healthy_adapter(backend).await?;

        let params = serde_json::json!({ "uri": original });
        Ok(adapter.request("resources/read", Some(params)).await?)
    }

    /// Fetch a namespaced prompt from its backend.
    pub async fn route_prompt_get(
        &self,
        namespaced: &str,
        arguments: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse> {
        let (backend, original) = split_name(namespaced)
            .ok_or_else(|| Error::Unparseable(namespaced.to_string()))?;
        let adapter = self.healthy_adapter(backend).await?;

        let mut params = serde_json::json!({ "name": original });
        if let Some(arguments) = arguments {
            params["arguments"] = arguments;
        }
        Ok(adapter.request("prompts/get", Some(params)).await?)
    }

    async fn healthy_adapter(&self, backend: &str) -> Result<Arc<junction_adapter::Adapter>> {
        let adapter = self.registry.adapter_ensure_started(backend).await?;
        let health = adapter.health();
        if health != Health::Healthy {
            return Err(Error::NotHealthy {
                id: backend.to_string(),
                health,
            });
        }
        Ok(adapter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use junction_adapter::BackendConfig;
    use junction_adapter::testing::{ScriptedTransport, scripted_adapter};

    fn config(id: &str) -> BackendConfig {
        BackendConfig {
            id: id.into(),
            command: Some("unused".into()),
            ..Default::default()
        }
    }

    // ── Namespacing ──────────────────────────────────────────────────

    #[test]
    fn name_round_trip() {
        for (backend, name) in [
            ("fs", "read_file"),
            ("My-Server_2", "x"),
            ("a", "nested__name"),
        ] {
            let namespaced = namespace_name(backend, name);
            assert_eq!(split_name(&namespaced), Some((backend, name)));
        }
    }

    #[test]
    fn uri_round_trip() {
        for (backend, uri) in [
            ("fs", "file:///etc/hosts"),
            ("docs", "docs://guide/intro"),
            ("a", "x"),
        ] {
            let namespaced = namespace_uri(backend, uri);
            assert_eq!(split_uri(&namespaced), Some((backend, uri)));
        }
    }

    #[test]
    fn name_without_separator_is_unparseable() {
        assert_eq!(split_name("read_file"), None);
    }

    #[test]
    fn name_with_empty_half_is_unparseable() {
        assert_eq!(split_name("__read_file"), None);
        assert_eq!(split_name("fs__"), None);
    }

    #[test]
    fn uri_with_invalid_backend_half_is_unparseable() {
        assert_eq!(split_uri("1fs://x"), None);
        assert_eq!(split_uri("://x"), None);
        assert_eq!(split_uri("fs://"), None);
        assert_eq!(split_uri("plain-string"), None);
    }

    #[test]
    fn uri_decode_takes_outermost_prefix() {
        assert_eq!(split_uri("fs://docs://x"), Some(("fs", "docs://x")));
    }

    // ── Routing ──────────────────────────────────────────────────────

    async fn router_with_backend(id: &str) -> (Router, Arc<ScriptedTransport>) {
        let registry = Arc::new(Registry::new());
        let (adapter, fake) = scripted_adapter(config(id));
        adapter.start().await.unwrap();
        registry.insert_for_tests(adapter).await;
        (Router::new(registry), fake)
    }

    #[tokio::test]
    async fn tool_call_forwards_unprefixed_name_and_arguments() {
        let (router, fake) = router_with_backend("fs").await;
        fake.set_reply(
            "tools/call",
            serde_json::json!({"content": [{"type": "text", "text": "ok"}]}),
        );

        let resp = router
            .route_tool_call("fs__read_file", Some(serde_json::json!({"path": "/a"})))
            .await
            .unwrap();
        assert!(resp.error.is_none());

        let call = fake
            .sent_frames()
            .into_iter()
            .find(|f| f.get("method").and_then(|m| m.as_str()) == Some("tools/call"))
            .expect("tools/call was not forwarded");
        assert_eq!(call["params"]["name"], "read_file");
        assert_eq!(call["params"]["arguments"]["path"], "/a");
    }

    #[tokio::test]
    async fn unknown_backend_is_reported() {
        let (router, _fake) = router_with_backend("fs").await;
        let err = router
            .route_tool_call("missing__x", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownBackend(id) if id == "missing"));
    }

    #[tokio::test]
    async fn unparseable_name_is_reported() {
        let (router, _fake) = router_with_backend("fs").await;
        let err = router.route_tool_call("no-separator", None).await.unwrap_err();
        assert!(matches!(err, Error::Unparseable(_)));
    }

    #[tokio::test]
    async fn backend_error_passes_through_verbatim() {
        let (router, fake) = router_with_backend("sse1").await;
        fake.set_error_reply("prompts/get", -32001, "nope");

        let resp = router.route_prompt_get("sse1__greet", None).await.unwrap();
        let err = resp.error.unwrap();
        assert_eq!(err.code, -32001);
        assert_eq!(err.message, "nope");
    }

    #[tokio::test]
    async fn resource_read_forwards_original_uri() {
        let (router, fake) = router_with_backend("fs").await;
        fake.set_reply("resources/read", serde_json::json!({"contents": []}));

        router
            .route_resource_read("fs://docs://deep/link")
            .await
            .unwrap();

        let call = fake
            .sent_frames()
            .into_iter()
            .find(|f| f.get("method").and_then(|m| m.as_str()) == Some("resources/read"))
            .unwrap();
        assert_eq!(call["params"]["uri"], "docs://deep/link");
    }

    #[tokio::test]
    async fn unhealthy_backend_is_refused() {
        let (router, _fake) = router_with_backend("fs").await;
        // The adapter stays connected; only its health is flipped, so the
        // ensure-started path does not restart it.
        router
            .registry
            .get("fs")
            .await
            .unwrap()
            .mark_unhealthy();

        let err = router.route_tool_call("fs__read_file", None).await.unwrap_err();
        assert!(matches!(err, Error::NotHealthy { .. }));
    }
}
