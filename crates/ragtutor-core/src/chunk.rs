//! Token-bounded recursive text chunker.
//!
//! Splits document text into [`Chunk`]s whose token count stays within a
//! configured `max_tokens`, carrying `overlap_tokens` of trailing context
//! from one chunk into the next so that sentences straddling a boundary
//! are retrievable from either side.
//!
//! Token counts come from a [`TokenCounter`], which should be the same
//! tokenizer the embedding model uses. [`HeuristicTokenCounter`] is the
//! dependency-free fallback (4 chars ≈ 1 token).
//!
//! # Algorithm
//!
//! 1. Pick the first separator from `"\n\n"`, `"\n"`, `" "`, `""` that
//!    occurs in the text (`""` means individual characters).
//! 2. Split on it, dropping empty pieces.
//! 3. Pieces that fit are queued; a piece that does not fit flushes the
//!    queue and is split recursively with the remaining separators.
//! 4. Queued pieces are merged into windows no larger than `max_tokens`.
//!    When a window is emitted, pieces are dropped from its front until at
//!    most `overlap_tokens` remain, and those seed the next window.
//!
//! The procedure has no hidden state, so identical text and settings always
//! yield identical chunks and identical fingerprints.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};

use crate::models::{Chunk, Document};

/// Approximate characters-per-token ratio for [`HeuristicTokenCounter`].
const CHARS_PER_TOKEN: usize = 4;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Measures text length in model tokens.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// `ceil(chars / 4)`. Never undercounts relative to itself when pieces are
/// concatenated, so windows merged from counted pieces stay within budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicTokenCounter;

impl TokenCounter for HeuristicTokenCounter {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(CHARS_PER_TOKEN)
    }
}

/// Size limits for the chunker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSettings {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkSettings {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            overlap_tokens: 200,
        }
    }
}

impl ChunkSettings {
    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            bail!("chunking.max_tokens must be > 0");
        }
        if self.overlap_tokens >= self.max_tokens {
            bail!(
                "chunking.overlap_tokens ({}) must be smaller than chunking.max_tokens ({})",
                self.overlap_tokens,
                self.max_tokens
            );
        }
        Ok(())
    }
}

/// Splits documents into overlapping, token-bounded chunks.
#[derive(Clone)]
pub struct Chunker {
    settings: ChunkSettings,
    counter: Arc<dyn TokenCounter>,
}

impl Chunker {
    pub fn new(settings: ChunkSettings, counter: Arc<dyn TokenCounter>) -> Result<Self> {
        settings.validate()?;
        Ok(Self { settings, counter })
    }

    /// Chunker using [`HeuristicTokenCounter`].
    pub fn heuristic(settings: ChunkSettings) -> Result<Self> {
        Self::new(settings, Arc::new(HeuristicTokenCounter))
    }

    pub fn settings(&self) -> ChunkSettings {
        self.settings
    }

    /// Chunk a document, attaching source identity, position, and fingerprint.
    ///
    /// Whitespace-only documents produce no chunks.
    pub fn chunk(&self, doc: &Document) -> Vec<Chunk> {
        let pieces = self.split(&doc.raw_text);
        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, text)| Chunk {
                fingerprint: fingerprint(&doc.source_id, &text),
                text,
                source_id: doc.source_id.clone(),
                chunk_index: index,
                total_chunks: total,
                created_at: doc.load_timestamp,
            })
            .collect()
    }

    /// Split raw text into chunk strings.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let (pos, separator) = separators
            .iter()
            .enumerate()
            .find(|(_, s)| s.is_empty() || text.contains(**s))
            .map(|(i, s)| (i, *s))
            .unwrap_or((separators.len() - 1, ""));
        let remaining = &separators[pos + 1..];

        let splits: Vec<&str> = if separator.is_empty() {
            text.char_indices()
                .map(|(i, c)| &text[i..i + c.len_utf8()])
                .collect()
        } else {
            text.split(separator).filter(|s| !s.is_empty()).collect()
        };

        let mut out = Vec::new();
        let mut fitting: Vec<&str> = Vec::new();

        for piece in splits {
            if self.counter.count(piece) <= self.settings.max_tokens {
                fitting.push(piece);
                continue;
            }
            if !fitting.is_empty() {
                out.extend(self.merge(&fitting, separator));
                fitting.clear();
            }
            if remaining.is_empty() {
                out.push(piece.trim().to_string());
            } else {
                out.extend(self.split_with(piece, remaining));
            }
        }

        if !fitting.is_empty() {
            out.extend(self.merge(&fitting, separator));
        }

        out.retain(|c| !c.is_empty());
        out
    }

    fn merge(&self, pieces: &[&str], separator: &str) -> Vec<String> {
        let sep_tokens = self.counter.count(separator);
        let max = self.settings.max_tokens;
        let overlap = self.settings.overlap_tokens;

        let mut out = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0usize;

        for &piece in pieces {
            let len = self.counter.count(piece);
            let joined = |w: &VecDeque<(&str, usize)>| if w.is_empty() { 0 } else { sep_tokens };

            if total + len + joined(&window) > max && !window.is_empty() {
                push_window(&mut out, &window, separator);
                while total > overlap
                    || (total > 0 && total + len + joined(&window) > max)
                {
                    let Some((_, front_len)) = window.pop_front() else {
                        break;
                    };
                    total -= front_len + if window.is_empty() { 0 } else { sep_tokens };
                }
            }

            total += len + joined(&window);
            window.push_back((piece, len));
        }

        push_window(&mut out, &window, separator);
        out
    }
}

fn push_window(out: &mut Vec<String>, window: &VecDeque<(&str, usize)>, separator: &str) {
    let text = window
        .iter()
        .map(|(p, _)| *p)
        .collect::<Vec<_>>()
        .join(separator);
    let text = text.trim();
    if !text.is_empty() {
        out.push(text.to_string());
    }
}

/// Collapse every run of Unicode whitespace to a single space and trim.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Deterministic chunk identity: SHA-256 (hex) of the source id and the
/// normalized chunk text.
///
/// The source id is part of the key so identical text in two files stays two
/// records, and per-source stale cleanup can never remove another source's
/// content.
pub fn fingerprint(source_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(normalize_text(text).as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::models::DocumentFormat;

    /// One token per whitespace-separated word.
    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    fn word_chunker(max_tokens: usize, overlap_tokens: usize) -> Chunker {
        Chunker::new(
            ChunkSettings {
                max_tokens,
                overlap_tokens,
            },
            Arc::new(WordCounter),
        )
        .unwrap()
    }

    fn doc(source_id: &str, text: &str) -> Document {
        Document {
            source_id: source_id.to_string(),
            format: DocumentFormat::Text,
            raw_text: text.to_string(),
            load_timestamp: Utc::now(),
        }
    }

    fn words(range: std::ops::Range<usize>) -> String {
        range.map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunker = Chunker::heuristic(ChunkSettings::default()).unwrap();
        let chunks = chunker.chunk(&doc("a.md", "Hello, world!"));
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].total_chunks, 1);
        assert_eq!(chunks[0].text, "Hello, world!");
        assert_eq!(chunks[0].source_id, "a.md");
    }

    #[test]
    fn test_whitespace_only_yields_nothing() {
        let chunker = Chunker::heuristic(ChunkSettings::default()).unwrap();
        assert!(chunker.chunk(&doc("a.md", "  \n\n\t ")).is_empty());
        assert!(chunker.chunk(&doc("a.md", "")).is_empty());
    }

    #[test]
    fn test_windows_overlap_by_configured_tokens() {
        let chunker = word_chunker(10, 3);
        let chunks = chunker.split(&words(0..25));
        assert_eq!(
            chunks,
            vec![words(0..10), words(7..17), words(14..24), words(21..25)]
        );
    }

    #[test]
    fn test_no_overlap() {
        let chunker = word_chunker(10, 0);
        let chunks = chunker.split(&words(0..20));
        assert_eq!(chunks, vec![words(0..10), words(10..20)]);
    }

    #[test]
    fn test_chunks_respect_max_tokens() {
        let text = (0..40)
            .map(|i| format!("Paragraph {} has a handful of words in it.", i))
            .collect::<Vec<_>>()
            .join("\n\n");
        let chunker = word_chunker(30, 5);
        for c in chunker.split(&text) {
            assert!(WordCounter.count(&c) <= 30, "oversized chunk: {}", c);
        }
    }

    #[test]
    fn test_paragraphs_preferred_over_words() {
        let text = format!("{}\n\n{}", words(0..6), words(6..12));
        let chunker = word_chunker(8, 0);
        assert_eq!(chunker.split(&text), vec![words(0..6), words(6..12)]);
    }

    #[test]
    fn test_multibyte_text_hard_split() {
        let chunker = Chunker::heuristic(ChunkSettings {
            max_tokens: 2,
            overlap_tokens: 0,
        })
        .unwrap();
        let chunks = chunker.split("┌──────────────────┐");
        assert!(chunks.len() > 1);
        assert_eq!(chunks.concat(), "┌──────────────────┐");
    }

    #[test]
    fn test_indices_contiguous_and_total_set() {
        let chunker = word_chunker(5, 1);
        let chunks = chunker.chunk(&doc("a.md", &words(0..40)));
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i);
            assert_eq!(c.total_chunks, chunks.len());
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha beta.\n\nGamma delta epsilon.\n\nZeta eta theta iota kappa.";
        let chunker = word_chunker(4, 1);
        let c1 = chunker.chunk(&doc("notes.txt", text));
        let c2 = chunker.chunk(&doc("notes.txt", text));
        assert_eq!(c1.len(), c2.len());
        for (a, b) in c1.iter().zip(c2.iter()) {
            assert_eq!(a.text, b.text);
            assert_eq!(a.fingerprint, b.fingerprint);
        }
    }

    #[test]
    fn test_fingerprint_ignores_whitespace_layout() {
        assert_eq!(
            fingerprint("a.md", "binary  search\nruns"),
            fingerprint("a.md", " binary search runs ")
        );
        assert_ne!(
            fingerprint("a.md", "binary search"),
            fingerprint("b.md", "binary search")
        );
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(Chunker::heuristic(ChunkSettings {
            max_tokens: 0,
            overlap_tokens: 0
        })
        .is_err());
        assert!(Chunker::heuristic(ChunkSettings {
            max_tokens: 10,
            overlap_tokens: 10
        })
        .is_err());
    }

    #[test]
    fn test_heuristic_counter() {
        assert_eq!(HeuristicTokenCounter.count(""), 0);
        assert_eq!(HeuristicTokenCounter.count("abcd"), 1);
        assert_eq!(HeuristicTokenCounter.count("abcde"), 2);
    }
}
