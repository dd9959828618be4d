//! Apps Script proxy backend
//!
//! The proxy holds the real API key and forwards `{ contents }` to Gemini.
//! It answers `{ text }` on success and `{ error: { message } }` on failure.
//! The body is sent as `text/plain` so the browser-facing deployment never
//! triggers a CORS preflight; this backend keeps the same wire format.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::gemini::Content;
use super::{BatchBackend, FragmentStream, GenerateRequest, ProviderError, StreamingBackend};

#[derive(Debug, Serialize)]
struct ProxyRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Deserialize)]
struct ProxyResponse {
    #[serde(default)]
    text: Option<Value>,
    #[serde(default)]
    error: Option<ProxyError>,
}

#[derive(Debug, Deserialize)]
struct ProxyError {
    #[serde(default)]
    message: Option<String>,
}

/// Backend that relays through a deployed proxy endpoint
pub struct ProxyBackend {
    client: Client,
    url: String,
}

impl ProxyBackend {
    pub fn new(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

fn parse_reply(body: &str) -> Result<String, ProviderError> {
    let reply: ProxyResponse = serde_json::from_str(body).map_err(|e| {
        ProviderError::MalformedResponse(format!("Proxy reply is not JSON: {}", e))
    })?;

    if let Some(error) = reply.error {
        return Err(ProviderError::Backend(
            error.message.unwrap_or_else(|| "Unknown error".to_string()),
        ));
    }

    match reply.text {
        Some(Value::String(text)) => Ok(text),
        _ => Err(ProviderError::MalformedResponse(
            "Proxy reply has no text field".to_string(),
        )),
    }
}

#[async_trait]
impl BatchBackend for ProxyBackend {
    fn name(&self) -> &str {
        "proxy"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, ProviderError> {
        // The proxy pins its own model and system prompt
        let body = ProxyRequest {
            contents: request.contents.iter().map(Content::from).collect(),
        };

        debug!(turns = body.contents.len(), "Proxy request");

        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/plain;charset=utf-8")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let details = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), details = %details, "Proxy request failed");
            return Err(ProviderError::transport(
                Some(status.as_u16()),
                status.canonical_reason().unwrap_or("Unknown status"),
            ));
        }

        let body = response.text().await?;
        parse_reply(&body)
    }
}

/// Proxy replies arrive whole; streaming callers get them as a single fragment
#[async_trait]
impl StreamingBackend for ProxyBackend {
    fn name(&self) -> &str {
        "proxy-stream"
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<FragmentStream, ProviderError> {
        let text = BatchBackend::generate(self, request).await?;
        Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
    }
}
