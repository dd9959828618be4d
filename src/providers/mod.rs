//! Model backend integrations
//!
//! A backend comes in one of two capabilities, chosen when a session is built:
//! [`BatchBackend`] returns one complete answer, [`StreamingBackend`] returns the
//! answer as a lazy sequence of text fragments. [`Backend`] tags which one a
//! session holds so callers can be written against either.

pub mod gemini;
pub mod proxy;
pub mod sse;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use thiserror::Error;

use crate::conversation::Turn;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {reason}")]
    Transport { status: Option<u16>, reason: String },

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn transport(status: Option<u16>, reason: impl Into<String>) -> Self {
        ProviderError::Transport {
            status,
            reason: reason.into(),
        }
    }

    /// The single string shown to the end user for this failure
    pub fn user_message(&self) -> String {
        match self {
            ProviderError::Configuration(msg) => msg.clone(),
            ProviderError::Transport {
                status: Some(status),
                reason,
            } => format!("Request failed: {} (Status: {})", reason, status),
            ProviderError::Transport { status: None, reason } => {
                format!("Request failed: {}", reason)
            }
            ProviderError::Backend(msg) => format!("API Error: {}", msg),
            ProviderError::MalformedResponse(_) => {
                "Invalid response format received from the backend.".to_string()
            }
            ProviderError::Cancelled => "Request cancelled.".to_string(),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        // A proxy deployment URL is a credential and must not reach the user
        ProviderError::Transport {
            status: err.status().map(|s| s.as_u16()),
            reason: err.without_url().to_string(),
        }
    }
}

/// Everything a backend needs to answer one user turn
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    pub model: String,
    pub system_instruction: Option<String>,
    /// Full history followed by the new user turn
    pub contents: Vec<Turn>,
}

/// Text fragments of one streamed reply, in arrival order
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ProviderError>> + Send>>;

#[async_trait]
pub trait BatchBackend: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerateRequest) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait StreamingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Issue the request and hand back the fragment sequence once the backend accepted it
    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<FragmentStream, ProviderError>;
}

#[derive(Clone)]
pub enum Backend {
    Batch(Arc<dyn BatchBackend>),
    Streaming(Arc<dyn StreamingBackend>),
}

impl Backend {
    pub fn name(&self) -> &str {
        match self {
            Backend::Batch(b) => b.name(),
            Backend::Streaming(b) => b.name(),
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, Backend::Streaming(_))
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Batch(b) => f.debug_tuple("Batch").field(&b.name()).finish(),
            Backend::Streaming(b) => f.debug_tuple("Streaming").field(&b.name()).finish(),
        }
    }
}
