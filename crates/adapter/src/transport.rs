//! The seam between the adapter core and the wire.
//!
//! A transport owns the raw connection and nothing else: framing semantics,
//! correlation, and retry policy all live above this trait in
//! [`crate::adapter`]. Inbound traffic is pushed through the event channel
//! handed to the transport at construction time.

use async_trait::async_trait;

use crate::error::Result;

/// What a transport reports back to the adapter that owns it.
#[derive(Debug)]
pub enum TransportEvent {
    /// One complete inbound JSON-RPC message (a single stdout line or a
    /// single SSE `message` event payload).
    Frame(String),
    /// The connection ended without `stop` being called.
    Closed { reason: String },
}

/// The four transport primitives. No dispatch beyond these is needed.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection (spawn the child, open the stream). Must be
    /// callable again after the connection was lost or stopped.
    async fn start(&self) -> Result<()>;

    /// Tear the connection down. Deliberate stops do not emit
    /// [`TransportEvent::Closed`].
    async fn stop(&self);

    fn is_connected(&self) -> bool;

    /// Write one framed message. The payload is a complete JSON-RPC document
    /// without trailing newline; the transport applies its own framing.
    async fn send_raw(&self, frame: &str) -> Result<()>;
}
