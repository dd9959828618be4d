//! Shared test fixtures: in-process HTTP servers and scripted backends

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::Request;
use axum::http::HeaderMap;
use axum::Router;
use tokio::sync::{mpsc, Notify};

use crate::core::{ChatSession, SessionFactory};
use crate::providers::{
    Backend, BatchBackend, FragmentStream, GenerateRequest, ProviderError, StreamingBackend,
};

/// Serve `app` on an ephemeral local port and return its base URL
pub async fn spawn_server(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[derive(Default)]
struct Recorded {
    hits: usize,
    path: Option<String>,
    headers: HeaderMap,
    body: Option<String>,
}

/// Captures the last request a fake server received
#[derive(Clone, Default)]
pub struct RecordedRequest {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordedRequest {
    pub async fn capture(&self, req: Request) {
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap_or_default();
        let mut recorded = self.inner.lock().unwrap();
        recorded.hits += 1;
        recorded.path = Some(parts.uri.path().to_string());
        recorded.headers = parts.headers;
        recorded.body = Some(String::from_utf8_lossy(&bytes).into_owned());
    }

    pub fn hits(&self) -> usize {
        self.inner.lock().unwrap().hits
    }

    pub fn path(&self) -> Option<String> {
        self.inner.lock().unwrap().path.clone()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn body(&self) -> Option<String> {
        self.inner.lock().unwrap().body.clone()
    }
}

/// Batch backend answering from a queue of canned results.
///
/// An optional gate holds every call until [`ScriptedBatch::release`] is called,
/// which lets tests observe the pending state.
#[derive(Clone, Default)]
pub struct ScriptedBatch {
    replies: Arc<Mutex<VecDeque<Result<String, ProviderError>>>>,
    requests: Arc<Mutex<Vec<GenerateRequest>>>,
    calls: Arc<AtomicUsize>,
    gate: Option<Arc<Notify>>,
}

impl ScriptedBatch {
    pub fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    pub fn gated(mut self) -> Self {
        self.gate = Some(Arc::new(Notify::new()));
        self
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn backend(&self) -> Backend {
        Backend::Batch(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BatchBackend for ScriptedBatch {
    fn name(&self) -> &str {
        "scripted-batch"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<String, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::transport(None, "no scripted reply")))
    }
}

/// Streaming backend whose fragments are pushed by the test through a channel.
///
/// Each call to `generate_stream` takes the next receiver; dropping the sender
/// ends that stream.
#[derive(Clone, Default)]
pub struct ScriptedStream {
    streams: Arc<Mutex<VecDeque<mpsc::UnboundedReceiver<Result<String, ProviderError>>>>>,
    requests: Arc<Mutex<Vec<GenerateRequest>>>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a stream for the next call and get the handle that feeds it
    pub fn push_stream(&self) -> mpsc::UnboundedSender<Result<String, ProviderError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    /// Queue a stream that yields `fragments` and then ends
    pub fn push_fragments(&self, fragments: &[&str]) {
        let tx = self.push_stream();
        for fragment in fragments {
            tx.send(Ok(fragment.to_string())).unwrap();
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn backend(&self) -> Backend {
        Backend::Streaming(Arc::new(self.clone()))
    }
}

#[async_trait]
impl StreamingBackend for ScriptedStream {
    fn name(&self) -> &str {
        "scripted-stream"
    }

    async fn generate_stream(
        &self,
        request: &GenerateRequest,
    ) -> Result<FragmentStream, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let rx = self
            .streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| ProviderError::transport(None, "no scripted stream"))?;

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })))
    }
}

/// Factory handing every session the same backend, or failing like an
/// unconfigured deployment. Accepts model ids starting with `gemini`.
pub struct FixedFactory {
    backend: Option<Backend>,
    created: AtomicUsize,
}

impl FixedFactory {
    pub fn arc(backend: Backend) -> Arc<Self> {
        Arc::new(Self {
            backend: Some(backend),
            created: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            backend: None,
            created: AtomicUsize::new(0),
        })
    }

    /// Sessions handed out so far
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

impl SessionFactory for FixedFactory {
    fn create(&self, model_id: &str) -> Result<ChatSession, ProviderError> {
        let backend = self.backend.clone().ok_or_else(|| {
            ProviderError::Configuration("Gemini API key is not configured.".to_string())
        })?;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(ChatSession::new(model_id, backend))
    }

    fn allows_model(&self, model_id: &str) -> bool {
        model_id.starts_with("gemini")
    }
}
