//! Direct Gemini REST backend
//!
//! Talks to `generateContent` for batch replies and to
//! `streamGenerateContent?alt=sse` for streamed ones. The API key travels in
//! the `x-goog-api-key` header.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conversation::Turn;

use super::{sse, BatchBackend, FragmentStream, GenerateRequest, ProviderError, StreamingBackend};

/// Finish reasons that mean the model refused to produce (more) text
const BLOCKING_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "RECITATION",
    "BLOCKLIST",
    "PROHIBITED_CONTENT",
    "SPII",
];

/// One role-tagged entry of a request's `contents`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    pub text: String,
}

impl From<&Turn> for Content {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role.as_str().to_string(),
            parts: vec![Part {
                text: turn.text.clone(),
            }],
        }
    }
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
}

impl From<&GenerateRequest> for GenerateContentRequest {
    fn from(request: &GenerateRequest) -> Self {
        Self {
            contents: request.contents.iter().map(Content::from).collect(),
            system_instruction: request
                .system_instruction
                .as_ref()
                .filter(|s| !s.trim().is_empty())
                .map(|text| SystemInstruction {
                    parts: vec![Part { text: text.clone() }],
                }),
        }
    }
}

/// Full response, or one SSE chunk of a streamed response
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

/// Error response from API
#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    message: String,
    #[serde(default)]
    status: Option<String>,
}

impl GenerateContentResponse {
    /// Text carried by this response.
    ///
    /// `Ok(None)` means the response was well-formed but held no text part.
    fn text(self) -> Result<Option<String>, ProviderError> {
        if let Some(error) = self.error {
            return Err(api_error(error));
        }
        if let Some(reason) = self.prompt_feedback.and_then(|f| f.block_reason) {
            return Err(ProviderError::Backend(format!("Prompt blocked: {}", reason)));
        }

        let Some(candidate) = self.candidates.into_iter().next() else {
            return Ok(None);
        };

        // A blocked candidate may still carry the text produced before the cut
        if let Some(reason) = candidate
            .finish_reason
            .filter(|r| BLOCKING_FINISH_REASONS.contains(&r.as_str()))
        {
            return Err(ProviderError::Backend(format!("Response blocked: {}", reason)));
        }

        let texts: Vec<String> = candidate
            .content
            .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
            .unwrap_or_default();

        if texts.is_empty() {
            return Ok(None);
        }

        Ok(Some(texts.concat()))
    }
}

fn api_error(error: ApiError) -> ProviderError {
    match error.status {
        Some(status) => ProviderError::Backend(format!("{} ({})", error.message, status)),
        None => ProviderError::Backend(error.message),
    }
}

/// Map a non-2xx answer to an error: structured bodies are backend errors,
/// anything else is a transport failure
fn error_from_status(status: StatusCode, body: &str) -> ProviderError {
    if let Ok(error_resp) = serde_json::from_str::<ErrorResponse>(body) {
        return api_error(error_resp.error);
    }
    ProviderError::transport(
        Some(status.as_u16()),
        status.canonical_reason().unwrap_or("Unknown status"),
    )
}

/// Parse one streamed chunk into its text fragment (possibly empty)
fn parse_chunk(data: &str) -> Result<String, ProviderError> {
    let chunk: GenerateContentResponse = serde_json::from_str(data).map_err(|e| {
        ProviderError::MalformedResponse(format!("Failed to parse stream chunk: {}", e))
    })?;
    Ok(chunk.text()?.unwrap_or_default())
}

/// Direct Gemini API backend
pub struct GeminiBackend {
    client: Client,
    api_base: String,
    api_key: String,
}

impl GeminiBackend {
    /// Create a backend on top of an existing HTTP client
    pub fn new(client: Client, api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    fn url(&self, model: &str, stream: bool) -> String {
        if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.api_base, model
            )
        } else {
            format!("{}/models/{}:generateContent", self.api_base, model)
        }
    }

    async fn post(
        &self,
        request: &GenerateRequest,
        stream: bool,
    ) -> Result<reqwest::Response, ProviderError> {
        let body = GenerateContentRequest::from(request);

        debug!(
            model = %request.model,
            turns = body.contents.len(),
            stream,
            "Gemini API request"
        );

        let response = self
            .client
            .post(self.url(&request.model, stream))
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_from_status(status, &body));
        }
        Ok(response)
    }
}

#[async_trait]
impl BatchBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, ProviderError> {
        let response = self.post(request, false).await?;
        let body = response.text().await?;

        let parsed: GenerateContentResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::MalformedResponse(format!("Failed to parse response: {}", e))
        })?;

        parsed.text()?.ok_or_else(|| {
            ProviderError::MalformedResponse("No text in response candidates".to_string())
        })
    }
}

#[async_trait]
impl StreamingBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini-stream"
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<FragmentStream, ProviderError> {
        let response = self.post(request, true).await?;

        let fragments = sse::data_events(response.bytes_stream()).filter_map(|event| async move {
            match event.and_then(|data| parse_chunk(&data)) {
                Ok(text) if text.is_empty() => None,
                other => Some(other),
            }
        });

        Ok(Box::pin(fragments))
    }
}
