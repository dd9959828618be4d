//! Backend settings: which endpoint to reach and how
//!
//! # Example
//!
//! ```toml
//! [backend]
//! mode = "proxy"
//! proxy_url = "https://script.google.com/macros/s/.../exec"
//! default_model = "gemini-2.5-flash"
//! streaming = false
//! ```

use serde::{Deserialize, Serialize};

use crate::providers::ProviderError;

use super::prompts::builtin;

/// Value shipped in unconfigured deployments for the proxy URL
pub const PROXY_URL_PLACEHOLDER: &str = "PASTE_YOUR_GOOGLE_APPS_SCRIPT_WEB_APP_URL_HERE";

/// Value shipped in unconfigured deployments for the API key
pub const API_KEY_PLACEHOLDER: &str = "PASTE_YOUR_API_KEY_HERE";

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// How the model backend is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// Talk to the Gemini REST API with an API key
    Direct,
    /// Relay through a deployed Apps Script web app
    Proxy,
}

impl std::str::FromStr for BackendMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "direct" => Ok(BackendMode::Direct),
            "proxy" => Ok(BackendMode::Proxy),
            other => Err(format!("unknown backend mode '{}'", other)),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default = "default_mode")]
    pub mode: BackendMode,

    /// Credential for direct mode
    #[serde(default)]
    pub api_key: Option<String>,

    /// Deployed proxy endpoint for proxy mode
    #[serde(default)]
    pub proxy_url: Option<String>,

    #[serde(default = "default_api_base")]
    pub api_base: String,

    #[serde(default = "default_model")]
    pub default_model: String,

    /// Models a user may switch to; empty means any id is accepted
    #[serde(default = "default_models")]
    pub available_models: Vec<String>,

    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,

    #[serde(default = "default_true")]
    pub streaming: bool,

    /// HTTP client timeout; the session core imposes none of its own
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

fn default_mode() -> BackendMode {
    BackendMode::Direct
}

fn default_api_base() -> String {
    DEFAULT_API_BASE.to_string()
}

fn default_model() -> String {
    "gemini-2.5-flash".to_string()
}

fn default_models() -> Vec<String> {
    vec![
        "gemini-2.5-flash".to_string(),
        "gemini-2.5-pro".to_string(),
        "gemini-2.0-flash".to_string(),
    ]
}

fn default_system_instruction() -> String {
    builtin::SYSTEM_INSTRUCTION.to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    120
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            api_key: None,
            proxy_url: None,
            api_base: default_api_base(),
            default_model: default_model(),
            available_models: default_models(),
            system_instruction: default_system_instruction(),
            streaming: true,
            timeout_secs: default_timeout(),
        }
    }
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("mode", &self.mode)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("proxy_url", &self.proxy_url)
            .field("api_base", &self.api_base)
            .field("default_model", &self.default_model)
            .field("available_models", &self.available_models)
            .field("streaming", &self.streaming)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl BackendSettings {
    /// Direct-mode settings with the given key
    pub fn direct(api_key: impl Into<String>) -> Self {
        Self {
            mode: BackendMode::Direct,
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Proxy-mode settings with the given endpoint
    pub fn proxy(url: impl Into<String>) -> Self {
        Self {
            mode: BackendMode::Proxy,
            proxy_url: Some(url.into()),
            streaming: false,
            ..Self::default()
        }
    }

    /// Override fields from environment-style lookups (`GEMINI_*`)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(mode) = lookup("GEMINI_MODE") {
            self.mode = mode.parse()?;
        }
        if let Some(key) = lookup("GEMINI_API_KEY") {
            self.api_key = Some(key);
        }
        if let Some(url) = lookup("GEMINI_PROXY_URL") {
            self.proxy_url = Some(url);
        }
        if let Some(base) = lookup("GEMINI_API_BASE") {
            self.api_base = base;
        }
        if let Some(model) = lookup("GEMINI_MODEL") {
            self.default_model = model;
        }
        if let Some(instruction) = lookup("GEMINI_SYSTEM_INSTRUCTION") {
            self.system_instruction = instruction;
        }
        if let Some(streaming) = lookup("GEMINI_STREAMING") {
            self.streaming = parse_bool(&streaming)
                .ok_or_else(|| format!("GEMINI_STREAMING: expected a boolean, got '{}'", streaming))?;
        }
        if let Some(timeout) = lookup("GEMINI_TIMEOUT_SECS") {
            self.timeout_secs = timeout
                .parse()
                .map_err(|_| format!("GEMINI_TIMEOUT_SECS: expected seconds, got '{}'", timeout))?;
        }
        Ok(())
    }

    /// Check that the configured endpoint is usable.
    ///
    /// Synchronous and side-effect free; runs before any client is built.
    pub fn validate(&self) -> Result<(), ProviderError> {
        match self.mode {
            BackendMode::Direct => {
                let key = self.api_key.as_deref().map(str::trim).unwrap_or_default();
                if key.is_empty() {
                    return Err(ProviderError::Configuration(
                        "Gemini API key is not configured. Set GEMINI_API_KEY.".to_string(),
                    ));
                }
                if key == API_KEY_PLACEHOLDER {
                    return Err(ProviderError::Configuration(
                        "Gemini API key is still the placeholder value. Set GEMINI_API_KEY."
                            .to_string(),
                    ));
                }
            }
            BackendMode::Proxy => {
                let url = self.proxy_url.as_deref().map(str::trim).unwrap_or_default();
                if url.is_empty() || url == PROXY_URL_PLACEHOLDER {
                    return Err(ProviderError::Configuration(
                        "Google Apps Script proxy URL is not configured. Set GEMINI_PROXY_URL."
                            .to_string(),
                    ));
                }
                let parsed = reqwest::Url::parse(url).map_err(|e| {
                    ProviderError::Configuration(format!("Invalid proxy URL '{}': {}", url, e))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(ProviderError::Configuration(format!(
                        "Proxy URL must be http(s), got '{}'",
                        parsed.scheme()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Whether `model_id` may be selected
    pub fn allows_model(&self, model_id: &str) -> bool {
        self.available_models.is_empty() || self.available_models.iter().any(|m| m == model_id)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio_test::{assert_err, assert_ok};

    fn is_config_error(result: Result<(), ProviderError>) -> bool {
        matches!(result, Err(ProviderError::Configuration(_)))
    }

    #[test]
    fn test_direct_requires_key() {
        assert!(is_config_error(BackendSettings::default().validate()));
        assert!(is_config_error(BackendSettings::direct("  ").validate()));
        assert!(is_config_error(BackendSettings::direct(API_KEY_PLACEHOLDER).validate()));
        assert_ok!(BackendSettings::direct("real-key").validate());
    }

    #[test]
    fn test_proxy_requires_real_url() {
        let mut settings = BackendSettings::proxy("");
        assert!(is_config_error(settings.validate()));

        settings.proxy_url = None;
        assert!(is_config_error(settings.validate()));

        settings.proxy_url = Some(PROXY_URL_PLACEHOLDER.to_string());
        assert!(is_config_error(settings.validate()));

        settings.proxy_url = Some("ftp://example.com/exec".to_string());
        assert_err!(settings.validate());

        settings.proxy_url = Some("https://script.google.com/macros/s/abc/exec".to_string());
        assert_ok!(settings.validate());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("GEMINI_MODE", "proxy"),
            ("GEMINI_PROXY_URL", "http://localhost:9000/exec"),
            ("GEMINI_STREAMING", "off"),
            ("GEMINI_TIMEOUT_SECS", "30"),
        ]
        .into_iter()
        .collect();

        let mut settings = BackendSettings::default();
        settings
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(settings.mode, BackendMode::Proxy);
        assert_eq!(settings.proxy_url.as_deref(), Some("http://localhost:9000/exec"));
        assert!(!settings.streaming);
        assert_eq!(settings.timeout_secs, 30);
        assert_ok!(settings.validate());
    }

    #[test]
    fn test_bad_override_is_reported() {
        let mut settings = BackendSettings::default();
        let result = settings.apply_overrides(|k| (k == "GEMINI_STREAMING").then(|| "maybe".into()));
        assert!(result.unwrap_err().contains("GEMINI_STREAMING"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let settings = BackendSettings::direct("super-secret");
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_allows_model() {
        let mut settings = BackendSettings::default();
        assert!(settings.allows_model("gemini-2.5-pro"));
        assert!(!settings.allows_model("gpt-4o"));

        settings.available_models.clear();
        assert!(settings.allows_model("anything"));
    }
}
