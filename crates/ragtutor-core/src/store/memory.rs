//! In-memory [`IndexStore`] for tests and embedding into other hosts.
//!
//! Records live in a `BTreeMap` behind `std::sync::RwLock`; similarity
//! search is brute-force cosine over every stored vector.

use std::collections::{BTreeMap, HashSet};
use std::sync::{PoisonError, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::models::{IndexRecord, ScoredChunk};

use super::IndexStore;

#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<BTreeMap<String, IndexRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a stored record.
    pub fn get(&self, fingerprint: &str) -> Option<IndexRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(fingerprint)
            .cloned()
    }
}

fn poisoned<T>(_: PoisonError<T>) -> anyhow::Error {
    anyhow!("in-memory store lock poisoned")
}

#[async_trait]
impl IndexStore for InMemoryStore {
    async fn existing_fingerprints(
        &self,
        fingerprints: &[String],
        model: &str,
    ) -> Result<HashSet<String>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(fingerprints
            .iter()
            .filter(|fp| records.get(*fp).is_some_and(|r| r.model == model))
            .cloned()
            .collect())
    }

    async fn upsert(&self, record: &IndexRecord) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        records.insert(record.fingerprint.clone(), record.clone());
        Ok(())
    }

    async fn touch(
        &self,
        fingerprint: &str,
        chunk_index: usize,
        total_chunks: usize,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut records = self.records.write().map_err(poisoned)?;
        if let Some(r) = records.get_mut(fingerprint) {
            r.chunk_index = chunk_index;
            r.total_chunks = total_chunks;
            r.last_synced_at = synced_at;
        }
        Ok(())
    }

    async fn fingerprints_for_source(&self, source_id: &str) -> Result<Vec<String>> {
        let records = self.records.read().map_err(poisoned)?;
        Ok(records
            .values()
            .filter(|r| r.source_id == source_id)
            .map(|r| r.fingerprint.clone())
            .collect())
    }

    async fn sources(&self) -> Result<Vec<String>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut sources: Vec<String> = records.values().map(|r| r.source_id.clone()).collect();
        sources.sort();
        sources.dedup();
        Ok(sources)
    }

    async fn delete(&self, fingerprints: &[String]) -> Result<u64> {
        let mut records = self.records.write().map_err(poisoned)?;
        Ok(fingerprints
            .iter()
            .filter(|fp| records.remove(*fp).is_some())
            .count() as u64)
    }

    async fn similarity_search(
        &self,
        query_vec: &[f32],
        model: &str,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let records = self.records.read().map_err(poisoned)?;
        let mut hits: Vec<ScoredChunk> = records
            .values()
            .filter(|r| r.model == model)
            .map(|r| ScoredChunk {
                fingerprint: r.fingerprint.clone(),
                source_id: r.source_id.clone(),
                chunk_index: r.chunk_index,
                total_chunks: r.total_chunks,
                text: r.text.clone(),
                vector: r.vector.clone(),
                similarity: cosine_similarity(query_vec, &r.vector),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(top_n);
        Ok(hits)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.records.read().map_err(poisoned)?.len() as u64)
    }
}
