//! Conversation types
//!
//! Two views of the same exchange live here:
//! - [`ConversationHistory`] is what gets sent to the backend (role-tagged turns).
//! - [`Message`] is what gets shown (transcript entries with stable ids).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Role of a turn in the outbound history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// One role-tagged unit of the history sent to the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            text: text.into(),
        }
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: Role::Model,
            text: text.into(),
        }
    }
}

/// Ordered history of completed exchanges.
///
/// Turns are only ever added in user/model pairs through [`ConversationHistory::commit`]
/// and withdrawn in pairs through [`ConversationHistory::retract_last`], so the
/// history always alternates and its length is always even.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConversationHistory {
    turns: Vec<Turn>,
}

impl ConversationHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished exchange
    pub fn commit(&mut self, user_text: &str, model_text: &str) {
        self.turns.push(Turn::user(user_text));
        self.turns.push(Turn::model(model_text));
    }

    /// Withdraw the most recent exchange. Returns `false` if there was none.
    pub fn retract_last(&mut self) -> bool {
        if self.turns.len() < 2 {
            return false;
        }
        self.turns.truncate(self.turns.len() - 2);
        true
    }

    /// The turns to send for a new request: everything so far plus the pending user turn
    pub fn with_pending(&self, user_text: &str) -> Vec<Turn> {
        let mut turns = Vec::with_capacity(self.turns.len() + 1);
        turns.extend(self.turns.iter().cloned());
        turns.push(Turn::user(user_text));
        turns
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }
}

/// Who a displayed message belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Model,
}

/// A message in the displayed transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: Sender,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text.into())
    }

    /// Empty model message inserted while a reply is on its way
    pub fn placeholder() -> Self {
        Self::new(Sender::Model, String::new())
    }

    pub fn model(text: impl Into<String>) -> Self {
        Self::new(Sender::Model, text.into())
    }

    fn new(sender: Sender, text: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            text,
            created_at: Utc::now(),
        }
    }
}
