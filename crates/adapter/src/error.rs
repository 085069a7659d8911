use junction_common::FromMessage;

/// Breaker snapshot carried by [`Error::CircuitOpen`] so callers can report
/// the breaker state alongside the rejection.
pub use crate::breaker::BreakerStatus;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("backend '{backend}': {reason}")]
    InvalidConfig { backend: String, reason: String },

    #[error("failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake timed out after {seconds}s")]
    HandshakeTimeout { seconds: u64 },

    #[error("request '{method}' timed out after {seconds}s")]
    RequestTimeout { method: String, seconds: u64 },

    #[error("transport lost: {0}")]
    TransportLost(String),

    #[error("adapter stopped")]
    Stopped,

    #[error("circuit open")]
    CircuitOpen(BreakerStatus),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    UrlParse(#[from] url::ParseError),

    #[error("{message}")]
    Message { message: String },
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message { message }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

junction_common::impl_context!();
