//! Token counting for the chunker.
//!
//! With `chunking.tokenizer_path` set (and the `hf-tokenizer` feature
//! enabled), chunk sizes are measured with the embedding model's own
//! HuggingFace tokenizer. Otherwise the 4-chars-per-token heuristic from
//! the core crate is used.

use std::sync::Arc;

use anyhow::Result;
use ragtutor_core::chunk::{HeuristicTokenCounter, TokenCounter};

use crate::config::ChunkingConfig;

#[cfg(feature = "hf-tokenizer")]
pub struct HfTokenCounter {
    tokenizer: tokenizers::Tokenizer,
}

#[cfg(feature = "hf-tokenizer")]
impl HfTokenCounter {
    /// Load a `tokenizer.json`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            anyhow::anyhow!("Failed to load tokenizer {}: {}", path.display(), e)
        })?;
        Ok(Self { tokenizer })
    }
}

#[cfg(feature = "hf-tokenizer")]
impl TokenCounter for HfTokenCounter {
    fn count(&self, text: &str) -> usize {
        match self.tokenizer.encode(text, false) {
            Ok(encoding) => encoding.len(),
            Err(e) => {
                tracing::debug!(error = %e, "tokenizer failed, using heuristic count");
                HeuristicTokenCounter.count(text)
            }
        }
    }
}

/// Token counter for the configured chunking settings.
pub fn build_counter(config: &ChunkingConfig) -> Result<Arc<dyn TokenCounter>> {
    match &config.tokenizer_path {
        #[cfg(feature = "hf-tokenizer")]
        Some(path) => Ok(Arc::new(HfTokenCounter::from_file(path)?)),
        #[cfg(not(feature = "hf-tokenizer"))]
        Some(path) => anyhow::bail!(
            "chunking.tokenizer_path ({}) requires building with --features hf-tokenizer",
            path.display()
        ),
        None => Ok(Arc::new(HeuristicTokenCounter)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_heuristic() {
        let counter = build_counter(&ChunkingConfig::default()).unwrap();
        assert_eq!(counter.count("abcdefgh"), 2);
        assert_eq!(counter.count("abcdefghi"), 3);
    }

    #[cfg(feature = "hf-tokenizer")]
    #[test]
    fn test_missing_tokenizer_file_errors() {
        let config = ChunkingConfig {
            tokenizer_path: Some("/nonexistent/tokenizer.json".into()),
            ..ChunkingConfig::default()
        };
        assert!(build_counter(&config).is_err());
    }
}
