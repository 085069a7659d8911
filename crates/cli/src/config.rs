//! TOML configuration file: one `[gateway]` table and one `[backends.<id>]`
//! table per backend.

use std::{collections::BTreeMap, path::Path};

use {
    anyhow::Context,
    serde::Deserialize,
};

use junction_adapter::BackendConfig;

#[derive(Debug, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub gateway: GatewaySettings,
    /// Backends keyed by identifier. A `BTreeMap` keeps registration order
    /// deterministic across runs, so clients see a stable catalog.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendConfig>,
}

#[derive(Debug, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_session_timeout")]
    pub session_timeout_secs: u64,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8700
}

fn default_session_timeout() -> u64 {
    300
}

fn default_health_interval() -> u64 {
    30
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            session_timeout_secs: default_session_timeout(),
            health_check_interval_secs: default_health_interval(),
        }
    }
}

/// Load and parse the configuration file. The backend table key becomes the
/// backend identifier.
pub fn load(path: &Path) -> anyhow::Result<FileConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let mut config: FileConfig = toml::from_str(&text)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    for (id, backend) in &mut config.backends {
        backend.id = id.clone();
    }
    Ok(config)
}
