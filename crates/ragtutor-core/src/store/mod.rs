//! Index store abstraction.
//!
//! The [`IndexStore`] trait is the only way the synchronizer and the
//! retriever touch persisted vectors, so backends are pluggable: SQLite in
//! the app crate, [`memory::InMemoryStore`] for tests.
//!
//! Every store is scoped to one collection; fingerprints are unique within
//! it.

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{IndexRecord, ScoredChunk};

/// Abstract storage backend for embedded chunks.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`existing_fingerprints`](IndexStore::existing_fingerprints) | Which fingerprints are already embedded with `model` |
/// | [`upsert`](IndexStore::upsert) | Insert or replace a record |
/// | [`touch`](IndexStore::touch) | Refresh position and sync time of an unchanged record |
/// | [`fingerprints_for_source`](IndexStore::fingerprints_for_source) | All fingerprints stored for a source |
/// | [`sources`](IndexStore::sources) | All source ids with at least one record |
/// | [`delete`](IndexStore::delete) | Remove records by fingerprint |
/// | [`similarity_search`](IndexStore::similarity_search) | Top-n records of one model by cosine similarity |
/// | [`count`](IndexStore::count) | Number of stored records |
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Subset of `fingerprints` already stored with vectors from `model`.
    ///
    /// Records embedded by another model are reported as absent so they get
    /// re-embedded and replaced.
    async fn existing_fingerprints(
        &self,
        fingerprints: &[String],
        model: &str,
    ) -> Result<HashSet<String>>;

    async fn upsert(&self, record: &IndexRecord) -> Result<()>;

    async fn touch(
        &self,
        fingerprint: &str,
        chunk_index: usize,
        total_chunks: usize,
        synced_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn fingerprints_for_source(&self, source_id: &str) -> Result<Vec<String>>;

    async fn sources(&self) -> Result<Vec<String>>;

    /// Delete records by fingerprint, returning how many were removed.
    async fn delete(&self, fingerprints: &[String]) -> Result<u64>;

    /// Up to `top_n` records embedded by `model`, ranked by cosine similarity
    /// to `query_vec`, best first.
    ///
    /// Vectors from another model live in a different space and are never
    /// returned.
    async fn similarity_search(
        &self,
        query_vec: &[f32],
        model: &str,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>>;

    async fn count(&self) -> Result<u64>;
}
