//! # ragtutor
//!
//! A retrieval-augmented study tutor for data structures and algorithms.
//!
//! Course material (PDF, Markdown, plain text) is chunked, embedded and
//! kept in a SQLite index that re-ingestion updates incrementally. Each
//! question retrieves a diverse set of chunks with maximal marginal
//! relevance and streams an answer from a chat model, grounded in those
//! chunks, the current session and a window of earlier sessions.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │   Loaders   │──▶│ Chunk + Sync │──▶│    SQLite    │
//! │ PDF/MD/TXT  │   │   (embed)    │   │ index_records│
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                   ┌──────────────┐   ┌──────▼───────┐
//!   history.log ───▶│   RagChain   │◀──│ MMR retriever│
//!                   │  (stream)    │   └──────────────┘
//!                   └──────┬───────┘
//!                          ▼
//!                   ┌──────────────┐
//!                   │ tutor ask /  │
//!                   │    chat      │
//!                   └──────────────┘
//! ```
//!
//! The storage- and transport-agnostic pieces (chunker, synchronizer,
//! retriever, prompt builder, chain) live in `ragtutor-core`. This crate
//! provides their SQLite, filesystem and HTTP backed implementations.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and API keys |
//! | [`db`] | SQLite connection |
//! | [`migrate`] | Index schema |
//! | [`sqlite_store`] | SQLite [`IndexStore`](ragtutor_core::store::IndexStore) |
//! | [`loader`] | Corpus scan and per-format loading |
//! | [`tokenizer`] | Token counters for chunking |
//! | [`embedding`] | Embedding providers |
//! | [`llm`] | Streaming chat model providers |
//! | [`history_log`] | Durable conversation log |
//! | [`ingest`] | `tutor ingest` |
//! | [`search`] | `tutor search` |
//! | [`chat`] | Turns, `tutor ask` and `tutor chat` |
//! | [`stats`] | `tutor stats` |

pub mod chat;
pub mod config;
pub mod db;
pub mod embedding;
pub mod history_log;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod migrate;
pub mod search;
pub mod sqlite_store;
pub mod stats;
pub mod tokenizer;
