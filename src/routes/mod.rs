//! API routes
//!
//! The browser front end drives one [`Reconciler`](crate::core::Reconciler)
//! through these endpoints and re-renders from `/v1/events`.

use std::convert::Infallible;

use axum::{
    extract::State,
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        Json,
    },
    routing::{get, post},
    Router,
};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;

use crate::conversation::Message;
use crate::core::{Phase, Rejection, SubmitOutcome};
use crate::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Serialize)]
struct ModelsResponse {
    models: Vec<String>,
    current: String,
}

/// Everything the UI needs to render the conversation
#[derive(Debug, Serialize)]
pub struct TranscriptView {
    pub model: String,
    pub phase: Phase,
    pub error: Option<String>,
    pub messages: Vec<Message>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChatResponse {
    Settled { message_id: Uuid, text: String },
    Failed { error: String, partial: Option<String> },
    Rejected { error: String },
}

#[derive(Debug, Deserialize)]
pub struct ModelRequest {
    pub model: String,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn rejection_status(rejection: &Rejection) -> StatusCode {
    match rejection {
        Rejection::NotInitialized => StatusCode::SERVICE_UNAVAILABLE,
        Rejection::Busy => StatusCode::CONFLICT,
        Rejection::EmptyInput | Rejection::UnknownModel(_) => StatusCode::BAD_REQUEST,
    }
}

fn rejected(rejection: Rejection) -> ApiError {
    (
        rejection_status(&rejection),
        Json(ErrorBody {
            error: rejection.to_string(),
        }),
    )
}

fn transcript_view(state: &AppState) -> TranscriptView {
    let reconciler = &state.reconciler;
    TranscriptView {
        model: reconciler.model_id(),
        phase: reconciler.phase(),
        error: reconciler.last_error(),
        messages: reconciler.messages(),
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(ModelsResponse {
        models: state.config.backend.available_models.clone(),
        current: state.reconciler.model_id(),
    })
}

async fn messages(State(state): State<AppState>) -> Json<TranscriptView> {
    Json(transcript_view(&state))
}

async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> (StatusCode, Json<ChatResponse>) {
    match state.reconciler.submit(&request.message).await {
        SubmitOutcome::Settled { message_id, text } => (
            StatusCode::OK,
            Json(ChatResponse::Settled { message_id, text }),
        ),
        SubmitOutcome::Failed { error, partial } => (
            StatusCode::BAD_GATEWAY,
            Json(ChatResponse::Failed { error, partial }),
        ),
        SubmitOutcome::Rejected(rejection) => (
            rejection_status(&rejection),
            Json(ChatResponse::Rejected {
                error: rejection.to_string(),
            }),
        ),
    }
}

async fn clear(State(state): State<AppState>) -> Result<Json<TranscriptView>, ApiError> {
    state.reconciler.clear_history().map_err(rejected)?;
    Ok(Json(transcript_view(&state)))
}

async fn select_model(
    State(state): State<AppState>,
    Json(request): Json<ModelRequest>,
) -> Result<Json<TranscriptView>, ApiError> {
    state
        .reconciler
        .switch_model(&request.model)
        .map_err(rejected)?;
    Ok(Json(transcript_view(&state)))
}

async fn cancel(State(state): State<AppState>) -> Json<CancelResponse> {
    Json(CancelResponse {
        cancelled: state.reconciler.cancel(),
    })
}

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut rx = state.reconciler.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse_event) => {
                        yield Ok(sse_event);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to encode transcript event");
                    }
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            }
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(models))
        .route("/v1/messages", get(messages))
        .route("/v1/chat", post(chat))
        .route("/v1/events", get(events))
        .route("/v1/clear", post(clear))
        .route("/v1/model", post(select_model))
        .route("/v1/cancel", post(cancel))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::Reconciler;
    use crate::testing::{FixedFactory, ScriptedBatch};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app(backend: &ScriptedBatch) -> Router {
        let state = AppState {
            config: Config::default(),
            reconciler: Reconciler::new(FixedFactory::arc(backend.backend()), "gemini-2.5-flash"),
        };
        router().with_state(state)
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_chat_settles() {
        let backend = ScriptedBatch::new(vec![Ok("hi there".to_string())]);
        let app = app(&backend);

        let response = app
            .clone()
            .oneshot(post_json("/v1/chat", serde_json::json!({ "message": "hello" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["status"], "settled");
        assert_eq!(body["text"], "hi there");

        let response = app
            .oneshot(Request::get("/v1/messages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert_eq!(body["phase"], "idle");
        assert_eq!(body["messages"].as_array().unwrap().len(), 3);
        assert_eq!(body["messages"][1]["sender"], "user");
        assert_eq!(body["messages"][2]["text"], "hi there");
    }

    #[tokio::test]
    async fn test_chat_failure_is_bad_gateway() {
        let backend = ScriptedBatch::new(vec![Err(
            crate::providers::ProviderError::transport(Some(500), "Internal Server Error"),
        )]);
        let response = app(&backend)
            .oneshot(post_json("/v1/chat", serde_json::json!({ "message": "x" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = json_body(response).await;
        assert_eq!(body["status"], "failed");
        assert_eq!(
            body["error"],
            "Request failed: Internal Server Error (Status: 500)"
        );
    }

    #[tokio::test]
    async fn test_blank_message_rejected() {
        let backend = ScriptedBatch::new(vec![]);
        let response = app(&backend)
            .oneshot(post_json("/v1/chat", serde_json::json!({ "message": "  " })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["status"], "rejected");
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn test_unknown_model_rejected() {
        let backend = ScriptedBatch::new(vec![]);
        let response = app(&backend)
            .oneshot(post_json("/v1/model", serde_json::json!({ "model": "gpt-4o" })))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "Unknown model: gpt-4o");
    }

    #[tokio::test]
    async fn test_clear_returns_greeting_only() {
        let backend = ScriptedBatch::new(vec![Ok("a".to_string())]);
        let app = app(&backend);
        app.clone()
            .oneshot(post_json("/v1/chat", serde_json::json!({ "message": "one" })))
            .await
            .unwrap();

        let response = app
            .oneshot(Request::post("/v1/clear").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_without_turn() {
        let backend = ScriptedBatch::new(vec![]);
        let response = app(&backend)
            .oneshot(Request::post("/v1/cancel").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(response).await["cancelled"], false);
    }
}
