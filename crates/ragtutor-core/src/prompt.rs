//! Structured prompt assembly.
//!
//! A [`Prompt`] is a system segment plus an ordered list of role-tagged
//! messages. Every segment is inserted literally: there is no template
//! syntax, so `{braces}` in history or context never need escaping.

use std::sync::Arc;

use serde::Serialize;

use crate::chunk::TokenCounter;
use crate::models::{ConversationMessage, Role};

/// Used when no instructions file is configured.
pub const DEFAULT_INSTRUCTIONS: &str = "You are a patient tutor for data structures and \
algorithms. Answer using the provided context where it is relevant. Guide the student \
step by step, ask a clarifying question when the request is ambiguous, and say so when \
the context does not contain the answer.";

const HISTORY_HEADING: &str = "## Previous sessions";
const CONTEXT_HEADING: &str = "## Context";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    System,
    User,
    Assistant,
}

impl From<Role> for PromptRole {
    fn from(role: Role) -> Self {
        match role {
            Role::User => PromptRole::User,
            Role::Assistant => PromptRole::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

/// Input to a [`crate::llm::LanguageModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub system: String,
    /// Conversation so far, ending with the current question.
    pub messages: Vec<PromptMessage>,
}

impl Prompt {
    /// System segment first, then every message, as one ordered list.
    pub fn to_messages(&self) -> Vec<PromptMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 1);
        out.push(PromptMessage {
            role: PromptRole::System,
            content: self.system.clone(),
        });
        out.extend(self.messages.iter().cloned());
        out
    }
}

/// Builds prompts from fixed instructions plus per-turn inputs.
#[derive(Clone)]
pub struct PromptBuilder {
    instructions: String,
    context_budget: Option<(usize, Arc<dyn TokenCounter>)>,
}

impl PromptBuilder {
    pub fn new(instructions: impl Into<String>) -> Self {
        Self {
            instructions: instructions.into(),
            context_budget: None,
        }
    }

    /// Cap the context block at `max_tokens`. Chunks are kept whole, in
    /// retrieval order, until the next one would exceed the cap.
    pub fn with_context_budget(mut self, max_tokens: usize, counter: Arc<dyn TokenCounter>) -> Self {
        self.context_budget = Some((max_tokens, counter));
        self
    }

    pub fn instructions(&self) -> &str {
        &self.instructions
    }

    /// Join retrieved texts with blank lines, honoring the context budget.
    pub fn context_block<S: AsRef<str>>(&self, chunks: &[S]) -> String {
        let mut kept: Vec<&str> = Vec::with_capacity(chunks.len());
        let mut used = 0usize;
        for chunk in chunks {
            let text = chunk.as_ref();
            if let Some((max, counter)) = &self.context_budget {
                let cost = counter.count(text);
                if used + cost > *max {
                    break;
                }
                used += cost;
            }
            kept.push(text);
        }
        kept.join("\n\n")
    }

    pub fn build<S: AsRef<str>>(
        &self,
        question: &str,
        session: &[ConversationMessage],
        context: &[S],
        long_term: Option<&str>,
    ) -> Prompt {
        let mut system = self.instructions.trim_end().to_string();

        if let Some(history) = long_term.filter(|h| !h.trim().is_empty()) {
            system.push_str("\n\n");
            system.push_str(HISTORY_HEADING);
            system.push('\n');
            system.push_str(history.trim_end());
        }

        system.push_str("\n\n");
        system.push_str(CONTEXT_HEADING);
        system.push('\n');
        system.push_str(&self.context_block(context));

        let mut messages: Vec<PromptMessage> = session
            .iter()
            .map(|m| PromptMessage {
                role: m.role.into(),
                content: m.content.clone(),
            })
            .collect();
        messages.push(PromptMessage {
            role: PromptRole::User,
            content: question.to_string(),
        });

        Prompt { system, messages }
    }
}
