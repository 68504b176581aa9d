//! In-session conversation state.

use chrono::{DateTime, Utc};

use crate::models::{ConversationMessage, Turn};

/// Greeting the assistant opens every session with.
pub const DEFAULT_GREETING: &str = "How can I help you?";

/// Ordered message list for one conversation, owned by the host.
///
/// Append-only and never truncated. Messages are added in user/assistant
/// pairs, and only once an answer has completed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSession {
    messages: Vec<ConversationMessage>,
}

impl ChatSession {
    pub fn new(greeting: impl Into<String>) -> Self {
        Self {
            messages: vec![ConversationMessage::assistant(greeting, Utc::now())],
        }
    }

    pub fn messages(&self) -> &[ConversationMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a completed question/answer pair, returning it as a log turn.
    pub fn push_turn(
        &mut self,
        user: impl Into<String>,
        assistant: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Turn {
        let turn = Turn {
            timestamp: at,
            user: user.into(),
            assistant: assistant.into(),
        };
        self.messages
            .push(ConversationMessage::user(turn.user.clone(), at));
        self.messages
            .push(ConversationMessage::assistant(turn.assistant.clone(), at));
        turn
    }
}

impl Default for ChatSession {
    fn default() -> Self {
        Self::new(DEFAULT_GREETING)
    }
}
