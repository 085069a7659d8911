//! Per-client SSE streams.
//!
//! Opening the event-stream endpoint creates a session and yields a stream
//! whose first event is `endpoint` with the paired message endpoint and the
//! session id. A `: ping` comment goes out every 30 seconds while the stream
//! is writable; when the client disconnects, the stream is dropped and the
//! guard releases the session.

use std::{
    convert::Infallible,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use {
    axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse},
    futures::Stream,
    tokio::sync::mpsc,
    tokio_stream::wrappers::UnboundedReceiverStream,
    tracing::debug,
};

use crate::session::SessionManager;

pub const MESSAGE_ENDPOINT: &str = "/message";
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Removes the session when the client's stream is dropped.
struct SessionGuard {
    id: String,
    sessions: Arc<SessionManager>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        debug!(session = %self.id, "event stream closed");
        self.sessions.remove(&self.id);
    }
}

/// The event stream handed to axum; owns the session guard.
pub struct SessionStream {
    inner: UnboundedReceiverStream<Event>,
    _guard: SessionGuard,
}

impl Stream for SessionStream {
    type Item = Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx).map(|e| e.map(Ok))
    }
}

/// Create a session and its SSE response. Returns the session id alongside
/// the response so callers can log it.
pub fn subscribe(sessions: Arc<SessionManager>) -> (String, Sse<KeepAliveStream<SessionStream>>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session_id = sessions.create(tx.clone());

    // First event: tell the client where to POST and which session it owns.
    let endpoint = Event::default().event("endpoint").data(
        serde_json::json!({
            "endpoint": MESSAGE_ENDPOINT,
            "sessionId": session_id,
        })
        .to_string(),
    );
    let _ = tx.send(endpoint);

    let stream = SessionStream {
        inner: UnboundedReceiverStream::new(rx),
        _guard: SessionGuard {
            id: session_id.clone(),
            sessions,
        },
    };

    let sse = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(HEARTBEAT_INTERVAL).text("ping"));
    (session_id, sse)
}

/// Wrap a JSON payload as a `message` event.
pub fn message_event(json: String) -> Event {
    Event::default().event("message").data(json)
}
