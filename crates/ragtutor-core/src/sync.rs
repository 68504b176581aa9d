//! Incremental synchronization of chunk batches into an [`IndexStore`].
//!
//! A run makes the store's content for every synced source match exactly the
//! chunks produced for it, embedding only fingerprints the store does not
//! already hold for the active model.
//!
//! # Phases
//!
//! 1. **Upsert**, per source in input order: de-duplicate fingerprints, ask
//!    the store which exist, embed the missing ones in batches of
//!    `batch_size`, upsert them, and touch the rest.
//! 2. **Cleanup**, after every source has been processed: for each source
//!    that completed phase 1, delete stored fingerprints not produced in this
//!    run. With [`CleanupMode::Full`], records of sources absent from the
//!    run are deleted too, unless listed in [`SyncOptions::keep_sources`].
//!
//! An embedding failure isolates one source: it is reported in
//! [`SyncReport::failures`], nothing is written for it, and its previous
//! records are left alone. Store errors abort the run.

use std::collections::HashSet;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::embedding::Embedder;
use crate::models::{Chunk, IndexRecord, SourceBatch};
use crate::store::IndexStore;

/// What to do with stored sources that are not part of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CleanupMode {
    /// Leave them untouched. Supports re-ingesting part of a corpus.
    #[default]
    Incremental,
    /// Delete them. The run is treated as the whole corpus.
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncOptions {
    pub batch_size: usize,
    pub cleanup: CleanupMode,
    /// Sources that still exist but produced no batch this run because they
    /// could not be read. Full cleanup leaves their records alone.
    pub keep_sources: HashSet<String>,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_size: 64,
            cleanup: CleanupMode::Incremental,
            keep_sources: HashSet::new(),
        }
    }
}

/// A source whose chunks could not be embedded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailure {
    pub source_id: String,
    pub error: String,
}

/// Outcome of a sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Chunks embedded and inserted.
    pub added: usize,
    /// Chunks already stored for the active model.
    pub skipped: usize,
    /// Stale records removed.
    pub deleted: u64,
    pub failures: Vec<SyncFailure>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    /// The store could not be read or written. Nothing from the run should be
    /// assumed durable; re-run it in full.
    #[error("index store error: {0:#}")]
    Store(anyhow::Error),
}

/// Reconcile `batches` against `store`.
pub async fn sync(
    store: &dyn IndexStore,
    embedder: &dyn Embedder,
    batches: &[SourceBatch],
    options: &SyncOptions,
) -> Result<SyncReport, SyncError> {
    let model = embedder.model_name().to_string();
    let batch_size = options.batch_size.max(1);
    let mut report = SyncReport::default();
    let mut completed: Vec<(&str, HashSet<String>)> = Vec::new();

    for batch in batches {
        let chunks = dedupe(&batch.chunks);
        let fingerprints: Vec<String> = chunks.iter().map(|c| c.fingerprint.clone()).collect();
        let existing = store
            .existing_fingerprints(&fingerprints, &model)
            .await
            .map_err(SyncError::Store)?;

        let (present, missing): (Vec<&Chunk>, Vec<&Chunk>) = chunks
            .into_iter()
            .partition(|c| existing.contains(&c.fingerprint));

        let vectors = match embed_all(embedder, &missing, batch_size).await {
            Ok(v) => v,
            Err(e) => {
                warn!(source = %batch.source_id, error = %e, "embedding failed, source skipped");
                report.failures.push(SyncFailure {
                    source_id: batch.source_id.clone(),
                    error: format!("{:#}", e),
                });
                continue;
            }
        };

        let now = Utc::now();
        for (chunk, vector) in missing.iter().zip(vectors) {
            let record = IndexRecord {
                fingerprint: chunk.fingerprint.clone(),
                source_id: chunk.source_id.clone(),
                vector,
                last_synced_at: now,
                text: chunk.text.clone(),
                chunk_index: chunk.chunk_index,
                total_chunks: chunk.total_chunks,
                model: model.clone(),
                created_at: chunk.created_at,
            };
            store.upsert(&record).await.map_err(SyncError::Store)?;
        }
        for chunk in &present {
            store
                .touch(&chunk.fingerprint, chunk.chunk_index, chunk.total_chunks, now)
                .await
                .map_err(SyncError::Store)?;
        }

        debug!(
            source = %batch.source_id,
            added = missing.len(),
            skipped = present.len(),
            "source synced"
        );
        report.added += missing.len();
        report.skipped += present.len();
        completed.push((batch.source_id.as_str(), fingerprints.into_iter().collect()));
    }

    for (source_id, produced) in &completed {
        let stale: Vec<String> = store
            .fingerprints_for_source(source_id)
            .await
            .map_err(SyncError::Store)?
            .into_iter()
            .filter(|fp| !produced.contains(fp))
            .collect();
        if stale.is_empty() {
            continue;
        }
        let removed = store.delete(&stale).await.map_err(SyncError::Store)?;
        debug!(source = %source_id, removed, "stale chunks deleted");
        report.deleted += removed;
    }

    if options.cleanup == CleanupMode::Full {
        let in_run: HashSet<&str> = batches.iter().map(|b| b.source_id.as_str()).collect();
        for source_id in store.sources().await.map_err(SyncError::Store)? {
            if in_run.contains(source_id.as_str()) || options.keep_sources.contains(&source_id) {
                continue;
            }
            let fps = store
                .fingerprints_for_source(&source_id)
                .await
                .map_err(SyncError::Store)?;
            let removed = store.delete(&fps).await.map_err(SyncError::Store)?;
            debug!(source = %source_id, removed, "removed source deleted");
            report.deleted += removed;
        }
    }

    Ok(report)
}

/// First occurrence of each fingerprint, in chunk order.
fn dedupe(chunks: &[Chunk]) -> Vec<&Chunk> {
    let mut seen = HashSet::new();
    chunks
        .iter()
        .filter(|c| seen.insert(c.fingerprint.as_str()))
        .collect()
}

async fn embed_all(
    embedder: &dyn Embedder,
    chunks: &[&Chunk],
    batch_size: usize,
) -> anyhow::Result<Vec<Vec<f32>>> {
    let mut vectors = Vec::with_capacity(chunks.len());
    for group in chunks.chunks(batch_size) {
        let texts: Vec<String> = group.iter().map(|c| c.text.clone()).collect();
        let out = embedder.embed(&texts).await?;
        if out.len() != texts.len() {
            anyhow::bail!(
                "embedder returned {} vectors for {} texts",
                out.len(),
                texts.len()
            );
        }
        vectors.extend(out);
    }
    Ok(vectors)
}
