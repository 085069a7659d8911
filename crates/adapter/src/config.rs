//! Per-backend configuration and admission validation.
//!
//! A backend's configuration is immutable once it has been admitted into the
//! registry. Validation happens here so that every later layer can trust the
//! identifier pattern and the environment overlay.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Transport used to reach a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Child process speaking newline-delimited JSON-RPC on stdio.
    #[default]
    Stdio,
    /// Remote server reached over HTTP with an SSE event stream.
    Sse,
}

/// Token acquisition settings for authenticated SSE backends
/// (client-credentials exchange against `token_url`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Refresh when the cached token is within this window of expiry.
    #[serde(default = "default_refresh_window")]
    pub refresh_window_secs: u64,
}

fn default_refresh_window() -> u64 {
    60
}

/// Configuration for a single backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique identifier; letter-led, alphanumeric/underscore/hyphen, max 64.
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub transport: TransportKind,
    /// Command to spawn (stdio transport).
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overlay applied on top of the parent environment.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Event-stream base URL (sse transport).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<TokenConfig>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When set, the backend is only started on first use.
    #[serde(default)]
    pub lazy_start: bool,
    /// Per-request deadline in seconds, clamped to [1, 300].
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Restart attempts before the adapter is terminally unhealthy.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_true() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 300;
const MAX_ID_LEN: usize = 64;
const MAX_ENV_VALUE_LEN: usize = 10_000;

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            transport: TransportKind::default(),
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            url: None,
            token: None,
            enabled: true,
            lazy_start: false,
            request_timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl BackendConfig {
    /// Per-request deadline, clamped to the allowed range.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS),
        )
    }

    /// Validate the configuration at admission time.
    pub fn validate(&self) -> Result<()> {
        if !is_valid_backend_id(&self.id) {
            return Err(self.invalid(
                "identifier must be letter-led, alphanumeric/underscore/hyphen, at most 64 chars",
            ));
        }
        // "__" and "://" are reserved by the namespacing scheme. The id
        // pattern already excludes ':' and '/', so only "__" needs a check.
        if self.id.contains("__") {
            return Err(self.invalid("identifier must not contain the reserved separator '__'"));
        }

        match self.transport {
            TransportKind::Stdio => {
                if self.command.as_deref().unwrap_or("").is_empty() {
                    return Err(self.invalid("stdio transport requires 'command'"));
                }
            }
            TransportKind::Sse => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(self.invalid("sse transport requires 'url'"));
                }
            }
        }

        for (name, value) in &self.env {
            if !is_valid_env_name(name) {
                return Err(self.invalid(format!("invalid environment variable name '{name}'")));
            }
            if value.len() > MAX_ENV_VALUE_LEN {
                return Err(self.invalid(format!(
                    "environment variable '{name}' exceeds {MAX_ENV_VALUE_LEN} characters"
                )));
            }
        }

        Ok(())
    }

    fn invalid(&self, reason: impl Into<String>) -> Error {
        Error::InvalidConfig {
            backend: self.id.clone(),
            reason: reason.into(),
        }
    }
}

/// `^[A-Za-z][A-Za-z0-9_-]{0,63}$`
pub fn is_valid_backend_id(id: &str) -> bool {
    let mut chars = id.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    first.is_ascii_alphabetic()
        && id.len() <= MAX_ID_LEN
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// `^[A-Za-z_][A-Za-z0-9_]*$`
fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
