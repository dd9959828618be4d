//! Core chat components
//!
//! Sessions talk to the backend and own the outbound history; the reconciler
//! owns the displayed transcript and keeps it in step with the session.

mod reconciler;
mod session;

pub use reconciler::{Phase, Reconciler, Rejection, SubmitOutcome, TranscriptEvent};
pub use session::{BackendFactory, ChatSession, Reply, ReplyStream, SessionFactory};
