//! Index store schema.
//!
//! Every statement is idempotent, so the schema is ensured both by
//! `tutor init` and at the start of every ingestion run.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create tables and indexes if they are missing.
pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_records (
            collection TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            source_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            total_chunks INTEGER NOT NULL,
            text TEXT NOT NULL,
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            embedding BLOB NOT NULL,
            created_at INTEGER NOT NULL,
            last_synced_at INTEGER NOT NULL,
            PRIMARY KEY (collection, fingerprint)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create index_records table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_index_records_source ON index_records(collection, source_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ingest_runs (
            id TEXT PRIMARY KEY,
            collection TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            documents INTEGER NOT NULL,
            added INTEGER NOT NULL,
            skipped INTEGER NOT NULL,
            deleted INTEGER NOT NULL,
            failed INTEGER NOT NULL,
            full_cleanup INTEGER NOT NULL DEFAULT 0
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create ingest_runs table")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_ingest_runs_finished ON ingest_runs(collection, finished_at DESC)",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// `tutor init`: open the database and ensure the schema.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;
    pool.close().await;
    Ok(())
}
