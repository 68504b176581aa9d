//! Core data models shared by the ingestion and query paths.

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// On-disk format of a corpus file, chosen from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Markdown,
    Text,
}

impl DocumentFormat {
    /// Format for `path` by extension (case-insensitive). `None` for
    /// anything the loaders do not handle.
    pub fn detect(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "pdf" => Some(DocumentFormat::Pdf),
            "md" | "markdown" => Some(DocumentFormat::Markdown),
            "txt" => Some(DocumentFormat::Text),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentFormat::Pdf => "pdf",
            DocumentFormat::Markdown => "markdown",
            DocumentFormat::Text => "text",
        }
    }
}

/// A loaded source file. Immutable; discarded once chunked.
#[derive(Debug, Clone)]
pub struct Document {
    /// Stable identity: the corpus-relative path with `/` separators.
    pub source_id: String,
    pub format: DocumentFormat,
    pub raw_text: String,
    pub load_timestamp: DateTime<Utc>,
}

/// A token-bounded segment of a document, the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub text: String,
    pub source_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// SHA-256 of the source id and normalized text. See [`crate::chunk::fingerprint`].
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// All chunks produced for one source in a single ingestion run.
///
/// An empty `chunks` list is meaningful: the source was seen but produced no
/// content, so every stored record for it is stale.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub source_id: String,
    pub chunks: Vec<Chunk>,
}

/// A stored, embedded chunk.
#[derive(Debug, Clone)]
pub struct IndexRecord {
    pub fingerprint: String,
    pub source_id: String,
    pub vector: Vec<f32>,
    pub last_synced_at: DateTime<Utc>,
    pub text: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Embedding model that produced `vector`.
    pub model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn user(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp,
        }
    }

    pub fn assistant(content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp,
        }
    }
}

/// One recorded question/answer pair in the durable log.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub timestamp: DateTime<Utc>,
    pub user: String,
    pub assistant: String,
}

/// A calendar-day block of the durable history log.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionBlock {
    pub date: NaiveDate,
    pub turns: Vec<Turn>,
    /// The block exactly as it appears in the log, header included.
    pub raw: String,
}

/// A chunk returned by similarity search, with its stored vector.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub fingerprint: String,
    pub source_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    pub vector: Vec<f32>,
    /// Cosine similarity to the query vector.
    pub similarity: f32,
}
