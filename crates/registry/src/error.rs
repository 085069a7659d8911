use junction_common::FromMessage;

use junction_adapter::Health;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("a backend with id '{0}' is already registered")]
    DuplicateId(String),

    #[error("no backend '{0}' is registered")]
    UnknownBackend(String),

    #[error("backend '{id}' is not healthy ({health})")]
    NotHealthy { id: String, health: Health },

    #[error("'{0}' is not a namespaced identifier")]
    Unparseable(String),

    #[error(transparent)]
    Adapter(#[from] junction_adapter::Error),

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
