//! Chat sessions: one model, one history, one backend
//!
//! A [`ChatSession`] turns a user message into a [`Reply`] and records the
//! exchange in its history only once the backend has delivered the whole answer.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use reqwest::Client;
use tracing::{debug, info};

use crate::config::{BackendMode, BackendSettings};
use crate::conversation::ConversationHistory;
use crate::providers::gemini::GeminiBackend;
use crate::providers::proxy::ProxyBackend;
use crate::providers::{Backend, FragmentStream, GenerateRequest, ProviderError};

/// Outcome of [`ChatSession::send`]
pub enum Reply<'a> {
    /// The whole answer; history is already updated
    Complete(String),
    /// The answer as it arrives; history is updated when the stream ends cleanly
    Stream(ReplyStream<'a>),
}

/// Fragments of a streamed answer, in arrival order.
///
/// Keeps its own accumulator and commits the exchange to the session history
/// exactly once, when the backend stream ends without error. An error ends the
/// stream and nothing is committed. Dropping it early commits nothing either.
/// A stream that ends before any text arrived yields a malformed-response error.
pub struct ReplyStream<'a> {
    inner: FragmentStream,
    history: &'a mut ConversationHistory,
    user_text: String,
    accumulated: String,
    fragments: usize,
    finished: bool,
    committed: bool,
}

impl<'a> ReplyStream<'a> {
    fn new(inner: FragmentStream, history: &'a mut ConversationHistory, user_text: &str) -> Self {
        Self {
            inner,
            history,
            user_text: user_text.to_string(),
            accumulated: String::new(),
            fragments: 0,
            finished: false,
            committed: false,
        }
    }

    /// Concatenation of every fragment yielded so far
    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Whether the exchange made it into the history
    pub fn is_committed(&self) -> bool {
        self.committed
    }
}

impl Stream for ReplyStream<'_> {
    type Item = Result<String, ProviderError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(fragment))) => {
                this.fragments += 1;
                this.accumulated.push_str(&fragment);
                Poll::Ready(Some(Ok(fragment)))
            }
            Poll::Ready(Some(Err(e))) => {
                this.finished = true;
                debug!(fragments = this.fragments, error = %e, "Reply stream aborted");
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) if this.accumulated.is_empty() => {
                this.finished = true;
                debug!(fragments = this.fragments, "Reply stream ended without text");
                Poll::Ready(Some(Err(empty_reply())))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.history.commit(&this.user_text, &this.accumulated);
                this.committed = true;
                debug!(
                    fragments = this.fragments,
                    chars = this.accumulated.len(),
                    "Reply stream complete"
                );
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn empty_reply() -> ProviderError {
    ProviderError::MalformedResponse("Reply contained no text".to_string())
}

/// A conversation bound to one model backend
pub struct ChatSession {
    model_id: String,
    system_instruction: Option<String>,
    history: ConversationHistory,
    backend: Backend,
}

impl ChatSession {
    pub fn new(model_id: impl Into<String>, backend: Backend) -> Self {
        Self {
            model_id: model_id.into(),
            system_instruction: None,
            history: ConversationHistory::new(),
            backend,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn history(&self) -> &ConversationHistory {
        &self.history
    }

    pub fn is_streaming(&self) -> bool {
        self.backend.is_streaming()
    }

    /// Withdraw the exchange committed by the last successful send
    pub fn retract_last_exchange(&mut self) -> bool {
        self.history.retract_last()
    }

    /// Send `text` as the next user turn.
    ///
    /// The request carries the full history plus the new turn. On failure the
    /// history is left exactly as it was.
    pub async fn send(&mut self, text: &str) -> Result<Reply<'_>, ProviderError> {
        let request = GenerateRequest {
            model: self.model_id.clone(),
            system_instruction: self.system_instruction.clone(),
            contents: self.history.with_pending(text),
        };

        match self.backend.clone() {
            Backend::Batch(backend) => {
                let reply = backend.generate(&request).await?;
                if reply.is_empty() {
                    return Err(empty_reply());
                }
                self.history.commit(text, &reply);
                debug!(
                    backend = backend.name(),
                    turns = self.history.len(),
                    "Exchange committed"
                );
                Ok(Reply::Complete(reply))
            }
            Backend::Streaming(backend) => {
                let fragments = backend.generate_stream(&request).await?;
                Ok(Reply::Stream(ReplyStream::new(
                    fragments,
                    &mut self.history,
                    text,
                )))
            }
        }
    }
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("model_id", &self.model_id)
            .field("turns", &self.history.len())
            .field("backend", &self.backend)
            .finish()
    }
}

/// Builds sessions for a model id
pub trait SessionFactory: Send + Sync {
    /// Construct a fresh session with empty history.
    ///
    /// Configuration problems must be reported here, before any network use.
    fn create(&self, model_id: &str) -> Result<ChatSession, ProviderError>;

    /// Whether `model_id` may be selected
    fn allows_model(&self, _model_id: &str) -> bool {
        true
    }
}

/// Production factory: builds Gemini or proxy backends from settings
pub struct BackendFactory {
    settings: BackendSettings,
    client: Client,
}

impl BackendFactory {
    /// `client` is shared by every session this factory creates
    pub fn new(settings: BackendSettings, client: Client) -> Self {
        Self { settings, client }
    }
}

impl SessionFactory for BackendFactory {
    fn create(&self, model_id: &str) -> Result<ChatSession, ProviderError> {
        self.settings.validate()?;

        let backend = match self.settings.mode {
            BackendMode::Direct => {
                let api_key = self.settings.api_key.clone().unwrap_or_default();
                let gemini = Arc::new(GeminiBackend::new(
                    self.client.clone(),
                    self.settings.api_base.clone(),
                    api_key,
                ));
                if self.settings.streaming {
                    Backend::Streaming(gemini)
                } else {
                    Backend::Batch(gemini)
                }
            }
            BackendMode::Proxy => {
                let url = self.settings.proxy_url.clone().unwrap_or_default();
                let proxy = Arc::new(ProxyBackend::new(self.client.clone(), url));
                if self.settings.streaming {
                    Backend::Streaming(proxy)
                } else {
                    Backend::Batch(proxy)
                }
            }
        };

        info!(model = model_id, backend = backend.name(), "Chat session created");

        Ok(ChatSession::new(model_id, backend)
            .with_system_instruction(self.settings.system_instruction.clone()))
    }

    fn allows_model(&self, model_id: &str) -> bool {
        self.settings.allows_model(model_id)
    }
}
