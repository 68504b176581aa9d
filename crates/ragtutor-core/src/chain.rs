//! Retrieval-augmented answer generation.
//!
//! [`RagChain::answer`] retrieves context for a question, builds a
//! [`Prompt`] from the instructions, optional long-term history, the
//! retrieved chunks and the session so far, and starts the model stream.
//! The chain holds no conversation state; recording a finished turn is up
//! to the caller.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use thiserror::Error;
use tracing::debug;

use crate::llm::{LanguageModel, TextStream};
use crate::prompt::{Prompt, PromptBuilder};
use crate::retrieve::{RetrievedChunk, Retriever};
use crate::session::ChatSession;

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("retrieval failed: {0:#}")]
    Retrieval(anyhow::Error),
    #[error("generation failed: {0:#}")]
    Generation(anyhow::Error),
}

#[derive(Clone)]
pub struct RagChain {
    retriever: Retriever,
    model: Arc<dyn LanguageModel>,
    prompts: PromptBuilder,
}

impl RagChain {
    pub fn new(retriever: Retriever, model: Arc<dyn LanguageModel>, prompts: PromptBuilder) -> Self {
        Self {
            retriever,
            model,
            prompts,
        }
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Retrieve context and build the prompt without calling the model.
    pub async fn prepare(
        &self,
        question: &str,
        session: &ChatSession,
        long_term: Option<&str>,
    ) -> Result<(Prompt, Vec<RetrievedChunk>), ChainError> {
        let sources = self
            .retriever
            .retrieve(question)
            .await
            .map_err(ChainError::Retrieval)?;
        let texts: Vec<&str> = sources.iter().map(|c| c.text.as_str()).collect();
        let prompt = self
            .prompts
            .build(question, session.messages(), &texts, long_term);
        debug!(chunks = sources.len(), messages = prompt.messages.len(), "prompt built");
        Ok((prompt, sources))
    }

    /// Start answering `question`.
    pub async fn answer(
        &self,
        question: &str,
        session: &ChatSession,
        long_term: Option<&str>,
    ) -> Result<AnswerStream, ChainError> {
        let (prompt, sources) = self.prepare(question, session, long_term).await?;
        let inner = self
            .model
            .stream(&prompt)
            .await
            .map_err(ChainError::Generation)?;
        Ok(AnswerStream { sources, inner })
    }
}

/// Streamed answer plus the chunks it was conditioned on.
pub struct AnswerStream {
    sources: Vec<RetrievedChunk>,
    inner: TextStream,
}

impl AnswerStream {
    pub fn sources(&self) -> &[RetrievedChunk] {
        &self.sources
    }

    /// Drain the stream into the full answer.
    pub async fn collect_answer(mut self) -> Result<String, ChainError> {
        let mut answer = String::new();
        while let Some(fragment) = self.next().await {
            answer.push_str(&fragment?);
        }
        Ok(answer)
    }
}

impl Stream for AnswerStream {
    type Item = Result<String, ChainError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner
            .as_mut()
            .poll_next(cx)
            .map(|item| item.map(|r| r.map_err(ChainError::Generation)))
    }
}
