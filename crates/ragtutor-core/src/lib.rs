//! # ragtutor core
//!
//! Runtime-agnostic logic for ragtutor: data models, chunking and
//! fingerprinting, the embedder / index-store / language-model traits,
//! incremental sync, MMR retrieval, prompt assembly, the history-log
//! format, and the RAG chain.
//!
//! This crate has no sqlx, filesystem, or HTTP dependencies. Hosts supply
//! concrete stores and model providers through the traits.

pub mod chain;
pub mod chunk;
pub mod embedding;
pub mod history;
pub mod llm;
pub mod models;
pub mod prompt;
pub mod retrieve;
pub mod session;
pub mod store;
pub mod sync;
