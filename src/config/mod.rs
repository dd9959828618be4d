//! Application configuration

pub mod backend;
pub mod prompts;

use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use backend::{BackendMode, BackendSettings};
pub use prompts::builtin as prompts_builtin;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub backend: BackendSettings,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    3000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend: BackendSettings::default(),
        }
    }
}

impl Config {
    /// Load from `RELAY_CONFIG` (if set) and then apply environment overrides.
    ///
    /// Backend credentials are not validated here; a missing key only surfaces
    /// when the first session is constructed.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = match env::var("RELAY_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };

        if let Ok(host) = env::var("HOST") {
            config.host = host;
        }
        if let Some(port) = env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            config.port = port;
        }
        config
            .backend
            .apply_overrides(|key| env::var(key).ok())
            .map_err(ConfigError::Validation)?;

        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
