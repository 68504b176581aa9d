//! Language-model contract.
//!
//! Providers (OpenAI-compatible, Gemini, Ollama) live in the app crate. The
//! contract is a lazy, finite, non-restartable stream of text fragments;
//! dropping the stream abandons the generation.

use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures::Stream;

use crate::prompt::Prompt;

/// Text fragments in generation order. An `Err` item ends the stream.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier for logs and `tutor stats`.
    fn name(&self) -> &str;

    /// Start generating an answer for `prompt`.
    ///
    /// Errors returned here mean the request never started; errors inside the
    /// stream mean it failed part-way.
    async fn stream(&self, prompt: &Prompt) -> Result<TextStream>;
}
