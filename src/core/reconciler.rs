//! Transcript reconciliation
//!
//! The [`Reconciler`] owns the displayed transcript and the live session. A
//! submission is applied optimistically (user message plus an empty model
//! placeholder), then filled in from the reply, or rolled back on failure.
//!
//! Turn lifecycle:
//!
//! ```text
//! Idle --submit--> Pending --stream opened--> Streaming
//!   ^                 |                           |
//!   +---- settled / failed (rollback) <-----------+
//! ```
//!
//! The session is checked out of the shared state for the duration of a turn,
//! so at most one exchange is ever in flight.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::prompts_builtin;
use crate::conversation::{Message, Turn};
use crate::providers::ProviderError;

use super::session::{ChatSession, Reply, SessionFactory};

const EVENT_CAPACITY: usize = 256;

/// Where the current turn is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Pending,
    Streaming,
}

/// Why a request was refused without touching any state
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("Chat session is not initialized.")]
    NotInitialized,

    #[error("A reply is still in progress.")]
    Busy,

    #[error("Message is empty.")]
    EmptyInput,

    #[error("Unknown model: {0}")]
    UnknownModel(String),
}

/// Result of [`Reconciler::submit`]
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// The placeholder now holds the final reply
    Settled { message_id: Uuid, text: String },
    /// The optimistic messages were removed; `partial` is any streamed text that had arrived
    Failed {
        error: String,
        partial: Option<String>,
    },
    Rejected(Rejection),
}

/// Transcript changes, in the order they were applied
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    TurnStarted { user: Message, placeholder: Message },
    PlaceholderUpdated { id: Uuid, text: String },
    TurnSettled { id: Uuid, text: String },
    TurnFailed {
        removed: Vec<Uuid>,
        error: String,
        partial: Option<String>,
    },
    Reset { messages: Vec<Message> },
}

struct State {
    /// `None` while a turn has it checked out, or when construction failed
    session: Option<ChatSession>,
    model_id: String,
    transcript: Vec<Message>,
    phase: Phase,
    last_error: Option<String>,
    in_flight: Option<CancellationToken>,
}

struct Inner {
    factory: Arc<dyn SessionFactory>,
    state: Mutex<State>,
    events: broadcast::Sender<TranscriptEvent>,
}

/// The ids of the two messages a turn added
#[derive(Debug, Clone, Copy)]
struct TurnIds {
    user: Uuid,
    placeholder: Uuid,
}

type TurnFailure = (ProviderError, Option<String>);

/// Shared handle to one conversation's transcript and session
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    /// Build the first session for `model_id`.
    ///
    /// A configuration failure is recorded in [`Reconciler::last_error`] and
    /// leaves the reconciler uninitialized; submissions are then rejected.
    pub fn new(factory: Arc<dyn SessionFactory>, model_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let model_id = model_id.into();

        let (session, last_error) = match factory.create(&model_id) {
            Ok(session) => (Some(session), None),
            Err(e) => {
                error!(model = %model_id, error = %e, "Failed to initialize chat session");
                (None, Some(e.user_message()))
            }
        };

        Self {
            inner: Arc::new(Inner {
                factory,
                state: Mutex::new(State {
                    session,
                    model_id,
                    transcript: vec![Message::model(prompts_builtin::GREETING)],
                    phase: Phase::Idle,
                    last_error,
                    in_flight: None,
                }),
                events,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: TranscriptEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TranscriptEvent> {
        self.inner.events.subscribe()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.lock().transcript.clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn model_id(&self) -> String {
        self.lock().model_id.clone()
    }

    pub fn is_initialized(&self) -> bool {
        let state = self.lock();
        state.phase != Phase::Idle || state.session.is_some()
    }

    /// Committed history of the live session; `None` while a turn is in flight
    /// or when no session could be built
    pub fn history(&self) -> Option<Vec<Turn>> {
        self.lock()
            .session
            .as_ref()
            .map(|s| s.history().turns().to_vec())
    }

    /// Submit a user message and wait for the turn to settle or fail.
    ///
    /// The exchange runs on its own task: dropping this future does not abort
    /// it, the turn still completes and the session is checked back in.
    pub async fn submit(&self, text: &str) -> SubmitOutcome {
        let (session, ids, token) = {
            let mut state = self.lock();
            if state.phase != Phase::Idle {
                return SubmitOutcome::Rejected(Rejection::Busy);
            }
            if text.trim().is_empty() {
                return SubmitOutcome::Rejected(Rejection::EmptyInput);
            }
            let Some(session) = state.session.take() else {
                return SubmitOutcome::Rejected(Rejection::NotInitialized);
            };

            let user = Message::user(text);
            let placeholder = Message::placeholder();
            let ids = TurnIds {
                user: user.id,
                placeholder: placeholder.id,
            };
            let token = CancellationToken::new();

            state.transcript.push(user.clone());
            state.transcript.push(placeholder.clone());
            state.phase = Phase::Pending;
            state.last_error = None;
            state.in_flight = Some(token.clone());
            self.emit(TranscriptEvent::TurnStarted { user, placeholder });

            (session, ids, token)
        };

        info!(chars = text.len(), "Turn submitted");

        let this = self.clone();
        let text = text.to_string();
        let turn = tokio::spawn(async move { this.drive_turn(session, text, ids, token).await });

        match turn.await {
            Ok(outcome) => outcome,
            Err(e) => {
                // The session went down with the task; only a reset can bring one back
                error!(error = %e, "Turn task failed");
                let error = "An internal error occurred while fetching the response.".to_string();
                let mut state = self.lock();
                state.in_flight = None;
                state.phase = Phase::Idle;
                self.roll_back(&mut state, ids, error.clone(), None);
                SubmitOutcome::Failed {
                    error,
                    partial: None,
                }
            }
        }
    }

    async fn drive_turn(
        &self,
        mut session: ChatSession,
        text: String,
        ids: TurnIds,
        token: CancellationToken,
    ) -> SubmitOutcome {
        let result = self.exchange(&mut session, &text, ids, &token).await;

        let mut state = self.lock();
        // `cancel` flips the token under this lock, so once `in_flight` is
        // cleared below it can no longer report success for this turn
        let result = match result {
            Ok(reply) if token.is_cancelled() => {
                debug!("Cancelled after the reply completed, withdrawing it");
                session.retract_last_exchange();
                Err((ProviderError::Cancelled, partial(&reply)))
            }
            other => other,
        };
        state.session = Some(session);
        state.in_flight = None;
        state.phase = Phase::Idle;

        match result {
            Ok(reply) => {
                if let Some(message) = state.transcript.iter_mut().find(|m| m.id == ids.placeholder) {
                    message.text = reply.clone();
                }
                info!(chars = reply.len(), "Turn settled");
                self.emit(TranscriptEvent::TurnSettled {
                    id: ids.placeholder,
                    text: reply.clone(),
                });
                SubmitOutcome::Settled {
                    message_id: ids.placeholder,
                    text: reply,
                }
            }
            Err((e, partial)) => {
                warn!(error = %e, "Turn failed, rolling back");
                let error = e.user_message();
                self.roll_back(&mut state, ids, error.clone(), partial.clone());
                SubmitOutcome::Failed { error, partial }
            }
        }
    }

    /// Run the exchange, honoring cancellation at every await
    async fn exchange(
        &self,
        session: &mut ChatSession,
        text: &str,
        ids: TurnIds,
        token: &CancellationToken,
    ) -> Result<String, TurnFailure> {
        let reply = tokio::select! {
            biased;
            _ = token.cancelled() => return Err((ProviderError::Cancelled, None)),
            reply = session.send(text) => reply.map_err(|e| (e, None))?,
        };

        let mut stream = match reply {
            Reply::Complete(reply) => return Ok(reply),
            Reply::Stream(stream) => stream,
        };

        self.lock().phase = Phase::Streaming;

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return Err((ProviderError::Cancelled, partial(stream.accumulated())));
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(_)) => self.update_placeholder(ids.placeholder, stream.accumulated()),
                Some(Err(e)) => return Err((e, partial(stream.accumulated()))),
                None => return Ok(stream.accumulated().to_string()),
            }
        }
    }

    /// Replace the placeholder text with everything received so far
    fn update_placeholder(&self, id: Uuid, accumulated: &str) {
        let mut state = self.lock();
        if let Some(message) = state.transcript.iter_mut().find(|m| m.id == id) {
            message.text = accumulated.to_string();
            self.emit(TranscriptEvent::PlaceholderUpdated {
                id,
                text: accumulated.to_string(),
            });
        }
    }

    /// Remove exactly the two messages the failed turn added
    fn roll_back(&self, state: &mut State, ids: TurnIds, error: String, partial: Option<String>) {
        let before = state.transcript.len();
        state
            .transcript
            .retain(|m| m.id != ids.user && m.id != ids.placeholder);
        debug!(removed = before - state.transcript.len(), "Optimistic turn removed");

        state.last_error = Some(error.clone());
        self.emit(TranscriptEvent::TurnFailed {
            removed: vec![ids.user, ids.placeholder],
            error,
            partial,
        });
    }

    /// Abort the in-flight turn, if any. The turn then fails and is rolled back.
    pub fn cancel(&self) -> bool {
        match &self.lock().in_flight {
            Some(token) => {
                info!("Cancelling in-flight turn");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the conversation and start over with a fresh session
    pub fn clear_history(&self) -> Result<(), Rejection> {
        let mut state = self.lock();
        if state.phase != Phase::Idle {
            return Err(Rejection::Busy);
        }
        let model_id = state.model_id.clone();
        self.reset(&mut state, model_id);
        Ok(())
    }

    /// Rebind to another model. History does not carry over.
    pub fn switch_model(&self, model_id: &str) -> Result<(), Rejection> {
        let mut state = self.lock();
        if state.phase != Phase::Idle {
            return Err(Rejection::Busy);
        }
        if !self.inner.factory.allows_model(model_id) {
            return Err(Rejection::UnknownModel(model_id.to_string()));
        }
        self.reset(&mut state, model_id.to_string());
        Ok(())
    }

    fn reset(&self, state: &mut State, model_id: String) {
        match self.inner.factory.create(&model_id) {
            Ok(session) => {
                state.session = Some(session);
                state.last_error = None;
            }
            Err(e) => {
                error!(model = %model_id, error = %e, "Failed to create chat session");
                state.session = None;
                state.last_error = Some(e.user_message());
            }
        }
        info!(model = %model_id, "Conversation reset");
        state.model_id = model_id;
        state.transcript = vec![Message::model(prompts_builtin::GREETING)];
        self.emit(TranscriptEvent::Reset {
            messages: state.transcript.clone(),
        });
    }
}

fn partial(accumulated: &str) -> Option<String> {
    (!accumulated.is_empty()).then(|| accumulated.to_string())
}
