//! Backend adapters for junction.
//!
//! This crate owns everything between the registry and a single backend MCP
//! server:
//! - backend configuration and admission validation (`config`)
//! - the four-method transport seam and its two implementations: child
//!   processes speaking newline-delimited JSON-RPC (`stdio`) and remote
//!   event-stream servers (`sse`)
//! - bearer-token acquisition for authenticated SSE backends (`token`)
//! - the transport-agnostic adapter core: request/reply correlation,
//!   handshake, retry supervision (`adapter`)
//! - the per-backend circuit breaker (`breaker`) and rolling stats (`stats`)

pub mod adapter;
pub mod breaker;
pub mod config;
pub mod error;
pub mod sse;
pub mod stats;
pub mod stdio;
pub mod token;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use {
    adapter::{Adapter, AdapterStatus, BackendNotification, Capabilities, Health},
    breaker::{BreakerConfig, BreakerStatus, CircuitBreaker, CircuitState},
    config::{BackendConfig, TokenConfig, TransportKind},
    error::{Error, Result},
    transport::{Transport, TransportEvent},
};
