//! Ingestion run orchestration.
//!
//! Coordinates one `tutor ingest`: schema → corpus scan → load → chunk →
//! embed and sync → run record. Per-file load failures and per-source
//! embedding failures are reported and skipped; store failures abort the
//! run. A full run never deletes records of a source it could not read.

use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use ragtutor_core::chunk::Chunker;
use ragtutor_core::embedding::Embedder;
use ragtutor_core::models::SourceBatch;
use ragtutor_core::store::IndexStore;
use ragtutor_core::sync::{sync, CleanupMode, SyncOptions, SyncReport};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, CorpusConfig, Secrets};
use crate::db;
use crate::embedding::create_embedder;
use crate::loader::{scan_corpus, CorpusFile};
use crate::migrate::ensure_schema;
use crate::sqlite_store::SqliteStore;
use crate::tokenizer::build_counter;

#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Restrict the run to these files or directories.
    pub paths: Vec<PathBuf>,
    /// Delete records of sources missing from the corpus.
    pub full: bool,
    pub dry_run: bool,
}

/// A corpus file that could not be loaded.
#[derive(Debug, Clone)]
pub struct LoadFailure {
    pub source_id: String,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct IngestSummary {
    pub run_id: String,
    pub documents: usize,
    pub chunks: usize,
    pub load_failures: Vec<LoadFailure>,
    pub report: SyncReport,
}

fn corpus(config: &Config) -> Result<&CorpusConfig> {
    config
        .corpus
        .as_ref()
        .context("No corpus configured. Add a [corpus] section with a root directory.")
}

/// Load and chunk every file, one [`SourceBatch`] per loaded file.
pub fn build_batches(chunker: &Chunker, files: &[CorpusFile]) -> (Vec<SourceBatch>, Vec<LoadFailure>) {
    let mut batches = Vec::with_capacity(files.len());
    let mut failures = Vec::new();

    for file in files {
        match file.load() {
            Ok(doc) => {
                let chunks = chunker.chunk(&doc);
                if chunks.is_empty() {
                    warn!(source = %file.source_id, "document has no text");
                }
                batches.push(SourceBatch {
                    source_id: doc.source_id,
                    chunks,
                });
            }
            Err(e) => {
                warn!(source = %file.source_id, error = %e, "skipping document");
                failures.push(LoadFailure {
                    source_id: file.source_id.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    (batches, failures)
}

/// Run an ingestion against an open store with a given embedder.
pub async fn ingest_with(
    config: &Config,
    store: &SqliteStore,
    embedder: &dyn Embedder,
    options: &IngestOptions,
) -> Result<IngestSummary> {
    if options.full && !options.paths.is_empty() {
        bail!("--full cannot be combined with paths: a partial scan is not the whole corpus");
    }

    let started_at = Utc::now();
    let chunker = Chunker::new(
        config.chunking.settings(),
        build_counter(&config.chunking)?,
    )?;
    let scan = scan_corpus(corpus(config)?, &options.paths)?;
    let (batches, load_failures) = build_batches(&chunker, &scan.files);
    let chunks = batches.iter().map(|b| b.chunks.len()).sum();

    let mut keep_sources: HashSet<String> =
        load_failures.iter().map(|f| f.source_id.clone()).collect();
    if options.full && !scan.unreadable.is_empty() {
        for source_id in store.sources().await? {
            if scan.is_unreadable(&source_id) {
                keep_sources.insert(source_id);
            }
        }
    }

    let sync_options = SyncOptions {
        batch_size: config.embedding.batch_size,
        cleanup: if options.full {
            CleanupMode::Full
        } else {
            CleanupMode::Incremental
        },
        keep_sources,
    };
    let report = sync(store, embedder, &batches, &sync_options).await?;

    let summary = IngestSummary {
        run_id: Uuid::new_v4().to_string(),
        documents: batches.len(),
        chunks,
        load_failures,
        report,
    };
    record_run(store.pool(), store.collection(), started_at.timestamp(), &summary, options.full)
        .await?;

    info!(
        run = %summary.run_id,
        added = summary.report.added,
        skipped = summary.report.skipped,
        deleted = summary.report.deleted,
        "ingest finished"
    );
    Ok(summary)
}

async fn record_run(
    pool: &SqlitePool,
    collection: &str,
    started_at: i64,
    summary: &IngestSummary,
    full: bool,
) -> Result<()> {
    let failed = summary.load_failures.len() + summary.report.failures.len();
    sqlx::query(
        r#"
        INSERT INTO ingest_runs (id, collection, started_at, finished_at, documents,
                                 added, skipped, deleted, failed, full_cleanup)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&summary.run_id)
    .bind(collection)
    .bind(started_at)
    .bind(Utc::now().timestamp())
    .bind(summary.documents as i64)
    .bind(summary.report.added as i64)
    .bind(summary.report.skipped as i64)
    .bind(summary.report.deleted as i64)
    .bind(failed as i64)
    .bind(full)
    .execute(pool)
    .await?;
    Ok(())
}

/// `tutor ingest`.
pub async fn run_ingest(config: &Config, options: &IngestOptions) -> Result<()> {
    if options.dry_run {
        return run_dry(config, options);
    }

    config.embedding.require_enabled()?;
    let secrets = Secrets::for_embedding(config)?;
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    let store = SqliteStore::new(pool.clone(), config.db.collection.clone());
    let embedder = create_embedder(&config.embedding, &secrets)?;

    let summary = ingest_with(config, &store, embedder.as_ref(), options).await?;

    println!("ingest {}", config.db.collection);
    println!("  documents: {}", summary.documents);
    println!("  chunks: {}", summary.chunks);
    println!("  added: {}", summary.report.added);
    println!("  skipped: {}", summary.report.skipped);
    println!("  deleted: {}", summary.report.deleted);
    println!(
        "  failed: {}",
        summary.load_failures.len() + summary.report.failures.len()
    );
    for f in &summary.load_failures {
        println!("    {}: {}", f.source_id, f.error);
    }
    for f in &summary.report.failures {
        println!("    {}: {}", f.source_id, f.error);
    }
    println!("ok");

    pool.close().await;
    Ok(())
}

/// Count what a run would process without embedding or writing anything.
fn run_dry(config: &Config, options: &IngestOptions) -> Result<()> {
    if options.full && !options.paths.is_empty() {
        bail!("--full cannot be combined with paths: a partial scan is not the whole corpus");
    }
    let chunker = Chunker::new(
        config.chunking.settings(),
        build_counter(&config.chunking)?,
    )?;
    let scan = scan_corpus(corpus(config)?, &options.paths)?;
    let (batches, failures) = build_batches(&chunker, &scan.files);

    println!("ingest {} (dry-run)", config.db.collection);
    println!("  files found: {}", scan.files.len());
    println!("  documents loaded: {}", batches.len());
    println!(
        "  estimated chunks: {}",
        batches.iter().map(|b| b.chunks.len()).sum::<usize>()
    );
    println!("  load failures: {}", failures.len());
    for f in &failures {
        println!("    {}: {}", f.source_id, f.error);
    }
    if !scan.unreadable.is_empty() {
        println!("  unreadable entries: {}", scan.unreadable.len());
    }
    Ok(())
}
