//! SQLite-backed [`IndexStore`].
//!
//! Records live in `index_records`, keyed by `(collection, fingerprint)`,
//! with vectors stored as little-endian f32 BLOBs. Similarity search is a
//! brute-force cosine scan over the collection, which is fast enough for a
//! study corpus of a few thousand chunks.

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use ragtutor_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use ragtutor_core::models::{IndexRecord, ScoredChunk};
use ragtutor_core::store::IndexStore;

/// SQLite implementation of [`IndexStore`], scoped to one collection.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    collection: String,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, collection: impl Into<String>) -> Self {
        Self {
            pool,
            collection: collection.into(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }
}

/// Bound parameters per `IN (...)` query, under SQLite's variable limit.
const SQL_IN_BATCH: usize = 500;

fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

#[async_trait]
impl IndexStore for SqliteStore {
    async fn existing_fingerprints(
        &self,
        fingerprints: &[String],
        model: &str,
    ) -> Result<HashSet<String>> {
        if fingerprints.is_empty() {
            return Ok(HashSet::new());
        }
        let mut found = HashSet::new();
        for group in fingerprints.chunks(SQL_IN_BATCH) {
            let placeholders = vec!["?"; group.len()].join(", ");
            let sql = format!(
                "SELECT fingerprint FROM index_records \
                 WHERE collection = ? AND model = ? AND fingerprint IN ({})",
                placeholders
            );
            let mut query = sqlx::query(&sql).bind(&self.collection).bind(model);
            for fp in group {
                query = query.bind(fp);
            }
            for row in query.fetch_all(&self.pool).await? {
                found.insert(row.get::<String, _>("fingerprint"));
            }
        }
        Ok(found)
    }

    async fn upsert(&self, record: &IndexRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO index_records (collection, fingerprint, source_id, chunk_index, total_chunks,
                                       text, model, dims, embedding, created_at, last_synced_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(collection, fingerprint) DO UPDATE SET
                source_id = excluded.source_id,
                chunk_index = excluded.chunk_index,
                total_chunks = excluded.total_chunks,
                text = excluded.text,
                model = excluded.model,
                dims = excluded.dims,
                embedding = excluded.embedding,
                created_at = excluded.created_at,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(&self.collection)
        .bind(&record.fingerprint)
        .bind(&record.source_id)
        .bind(record.chunk_index as i64)
        .bind(record.total_chunks as i64)
        .bind(&record.text)
        .bind(&record.model)
        .bind(record.vector.len() as i64)
        .bind(vec_to_blob(&record.vector))
        .bind(record.created_at.timestamp())
        .bind(record.last_synced_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn touch(
        &self,
        fingerprint: &str,
        chunk_index: usize,
        total_chunks: usize,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE index_records SET chunk_index = ?, total_chunks = ?, last_synced_at = ? \
             WHERE collection = ? AND fingerprint = ?",
        )
        .bind(chunk_index as i64)
        .bind(total_chunks as i64)
        .bind(synced_at.timestamp())
        .bind(&self.collection)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fingerprints_for_source(&self, source_id: &str) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT fingerprint FROM index_records WHERE collection = ? AND source_id = ? ORDER BY chunk_index",
        )
        .bind(&self.collection)
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("fingerprint")).collect())
    }

    async fn sources(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT source_id FROM index_records WHERE collection = ? ORDER BY source_id",
        )
        .bind(&self.collection)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("source_id")).collect())
    }

    async fn delete(&self, fingerprints: &[String]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut removed = 0u64;
        for fp in fingerprints {
            removed += sqlx::query("DELETE FROM index_records WHERE collection = ? AND fingerprint = ?")
                .bind(&self.collection)
                .bind(fp)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(removed)
    }

    async fn similarity_search(
        &self,
        query_vec: &[f32],
        model: &str,
        top_n: usize,
    ) -> Result<Vec<ScoredChunk>> {
        let rows = sqlx::query(
            r#"
            SELECT fingerprint, source_id, chunk_index, total_chunks, text, embedding
            FROM index_records
            WHERE collection = ? AND model = ?
            "#,
        )
        .bind(&self.collection)
        .bind(model)
        .fetch_all(&self.pool)
        .await?;

        let mut hits: Vec<ScoredChunk> = rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let vector = blob_to_vec(&blob);
                let chunk_index: i64 = row.get("chunk_index");
                let total_chunks: i64 = row.get("total_chunks");
                ScoredChunk {
                    fingerprint: row.get("fingerprint"),
                    source_id: row.get("source_id"),
                    chunk_index: chunk_index as usize,
                    total_chunks: total_chunks as usize,
                    text: row.get("text"),
                    similarity: cosine_similarity(query_vec, &vector),
                    vector,
                }
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
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM index_records WHERE collection = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

impl SqliteStore {
    /// Full stored record, for inspection and tests.
    pub async fn get(&self, fingerprint: &str) -> Result<Option<IndexRecord>> {
        let row = sqlx::query(
            "SELECT fingerprint, source_id, chunk_index, total_chunks, text, model, embedding, \
             created_at, last_synced_at FROM index_records WHERE collection = ? AND fingerprint = ?",
        )
        .bind(&self.collection)
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| {
            let blob: Vec<u8> = r.get("embedding");
            let chunk_index: i64 = r.get("chunk_index");
            let total_chunks: i64 = r.get("total_chunks");
            IndexRecord {
                fingerprint: r.get("fingerprint"),
                source_id: r.get("source_id"),
                vector: blob_to_vec(&blob),
                last_synced_at: from_ts(r.get("last_synced_at")),
                text: r.get("text"),
                chunk_index: chunk_index as usize,
                total_chunks: total_chunks as usize,
                model: r.get("model"),
                created_at: from_ts(r.get("created_at")),
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::ensure_schema;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn open(dir: &tempfile::TempDir) -> SqlitePool {
        let path = dir.path().join("index.sqlite");
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .unwrap()
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        ensure_schema(&pool).await.unwrap();
        pool
    }

    fn record(fp: &str, source: &str, vector: Vec<f32>) -> IndexRecord {
        IndexRecord {
            fingerprint: fp.to_string(),
            source_id: source.to_string(),
            vector,
            last_synced_at: from_ts(1_700_000_000),
            text: format!("text {}", fp),
            chunk_index: 0,
            total_chunks: 1,
            model: "m".to_string(),
            created_at: from_ts(1_700_000_000),
        }
    }

    #[tokio::test]
    async fn test_upsert_get_and_touch() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::new(open(&dir).await, "docs");
        store.upsert(&record("a", "x.md", vec![0.5, -1.0])).await.unwrap();
        store.upsert(&record("a", "x.md", vec![0.5, -1.0])).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 1);

        store.touch("a", 3, 7, from_ts(1_800_000_000)).await.unwrap();
        let got = store.get("a").await.unwrap().unwrap();
        assert_eq!(got.vector, vec![0.5, -1.0]);
        assert_eq!((got.chunk_index, got.total_chunks), (3, 7));
        assert_eq!(got.last_synced_at.timestamp(), 1_800_000_000);
    }

    #[tokio::test]
    async fn test_collections_are_isolated() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = open(&dir).await;
        let docs = SqliteStore::new(pool.clone(), "docs");
        let other = SqliteStore::new(pool, "other");
        docs.upsert(&record("a", "x.md", vec![1.0])).await.unwrap();

        assert_eq!(other.count().await.unwrap(), 0);
        assert!(other.sources().await.unwrap().is_empty());
        let fps = vec!["a".to_string()];
        assert!(other.existing_fingerprints(&fps, "m").await.unwrap().is_empty());
        assert_eq!(docs.existing_fingerprints(&fps, "m").await.unwrap().len(), 1);
        assert!(docs.existing_fingerprints(&fps, "other-model").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_and_delete() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::new(open(&dir).await, "docs");
        store.upsert(&record("near", "a.md", vec![1.0, 0.1])).await.unwrap();
        store.upsert(&record("far", "b.md", vec![0.0, 1.0])).await.unwrap();

        let hits = store.similarity_search(&[1.0, 0.0], "m", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].fingerprint, "near");

        let removed = store
            .delete(&["near".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.sources().await.unwrap(), vec!["b.md"]);
    }

    #[tokio::test]
    async fn test_search_ignores_records_from_other_models() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = SqliteStore::new(open(&dir).await, "docs");
        store.upsert(&record("current", "a.md", vec![0.2, 1.0])).await.unwrap();
        let mut stale = record("stale", "b.md", vec![1.0, 0.0]);
        stale.model = "old-model".to_string();
        store.upsert(&stale).await.unwrap();

        let hits = store.similarity_search(&[1.0, 0.0], "m", 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.fingerprint.as_str()).collect();
        assert_eq!(ids, vec!["current"]);
        assert_eq!(store.count().await.unwrap(), 2);
    }
}
