//! The MCP-facing gateway.
//!
//! Clients speak JSON-RPC 2.0 to a single endpoint and see one namespaced
//! catalog. This crate dispatches the MCP method set against the registry
//! and router, tracks client sessions, and multiplexes replies onto
//! per-client SSE streams.

pub mod gateway;
pub mod server;
pub mod session;
pub mod sse;

pub use {
    gateway::Gateway,
    server::{AppState, build_app, serve},
    session::SessionManager,
};
