//! HTTP surface: the client endpoints plus the read-only admin routes.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Json, Router,
        extract::State,
        http::HeaderMap,
        response::{IntoResponse, Sse, sse::KeepAliveStream},
        routing::{get, post},
    },
    serde_json::json,
    tower_http::cors::{Any, CorsLayer},
    tracing::{debug, info},
};

use junction_protocol::{JsonRpcResponse, error_codes};
use junction_registry::Registry;

use crate::{
    gateway::Gateway,
    session::SessionManager,
    sse::{self, SessionStream},
};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub registry: Arc<Registry>,
    pub sessions: Arc<SessionManager>,
}

/// Build the gateway router (shared between production startup and tests).
pub fn build_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/sse", get(sse_handler))
        .route("/message", post(message_handler))
        .route("/rpc", post(rpc_handler))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until ctrl-c, then fan shutdown out to every backend.
pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let registry = Arc::clone(&state.registry);
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            registry.shutdown().await;
        })
        .await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let backends = state.registry.status().await;
    Json(json!({
        "backends": backends,
        "sessions": state.sessions.snapshot(),
    }))
}

async fn sse_handler(State(state): State<AppState>) -> Sse<KeepAliveStream<SessionStream>> {
    let (session_id, sse) = sse::subscribe(Arc::clone(&state.sessions));
    debug!(session = %session_id, "event stream opened");
    sse
}

/// Session-bound message endpoint: replies are returned in the HTTP response
/// and mirrored onto the bound event stream.
async fn message_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Json<JsonRpcResponse> {
    let session_id = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        // An unknown session id does not fail the call, it just unbinds it.
        .filter(|sid| state.sessions.exists(sid));
    Json(handle_raw(&state, &body, session_id.as_deref()).await)
}

/// Stateless RPC endpoint: the reply only travels in the HTTP response.
async fn rpc_handler(State(state): State<AppState>, body: String) -> Json<JsonRpcResponse> {
    Json(handle_raw(&state, &body, None).await)
}

async fn handle_raw(state: &AppState, body: &str, session_id: Option<&str>) -> JsonRpcResponse {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(raw) if raw.is_object() => state.gateway.handle(raw, session_id).await,
        Ok(_) => JsonRpcResponse::error(
            json!(0),
            error_codes::INVALID_REQUEST,
            "request body must be a JSON object",
        ),
        Err(e) => JsonRpcResponse::error(
            json!(0),
            error_codes::INVALID_REQUEST,
            format!("invalid JSON: {e}"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn app_state() -> AppState {
        let registry = Arc::new(Registry::new());
        let sessions = Arc::new(SessionManager::new(Duration::from_secs(300)));
        let gateway = Arc::new(Gateway::new(
            Arc::clone(&registry),
            Arc::clone(&sessions),
        ));
        AppState {
            gateway,
            registry,
            sessions,
        }
    }

    #[tokio::test]
    async fn handle_raw_rejects_invalid_json() {
        let state = app_state();
        let resp = handle_raw(&state, "{not json", None).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
        assert_eq!(resp.id, json!(0));
    }

    #[tokio::test]
    async fn handle_raw_rejects_non_object_body() {
        let state = app_state();
        let resp = handle_raw(&state, "[1, 2, 3]", None).await;
        assert_eq!(resp.error.unwrap().code, error_codes::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn handle_raw_dispatches_ping() {
        let state = app_state();
        let resp = handle_raw(
            &state,
            r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#,
            None,
        )
        .await;
        assert!(resp.result.is_some());
        assert_eq!(resp.id, json!(1));
    }

    #[test]
    fn build_app_composes() {
        // Route collisions and bad state wiring panic at construction.
        let _app = build_app(app_state());
    }
}
