//! `tutor search`: show what the retriever would feed the model.
//!
//! Runs the same embed → similarity search → MMR pipeline as a chat turn
//! and prints the selected chunks in selection order, without calling the
//! language model.

use std::sync::Arc;

use anyhow::Result;
use ragtutor_core::retrieve::Retriever;

use crate::config::{Config, Secrets};
use crate::db;
use crate::embedding::create_embedder;
use crate::migrate::ensure_schema;
use crate::sqlite_store::SqliteStore;

const EXCERPT_CHARS: usize = 240;

pub async fn run_search(config: &Config, query: &str, k: Option<usize>) -> Result<()> {
    if query.trim().is_empty() {
        anyhow::bail!("Search query must not be empty");
    }

    config.embedding.require_enabled()?;
    let secrets = Secrets::for_embedding(config)?;
    let pool = db::connect(config).await?;
    ensure_schema(&pool).await?;

    let mut params = config.retrieval.params();
    if let Some(k) = k {
        params.k = k;
        params.fetch_k = params.fetch_k.max(k);
    }

    let store = Arc::new(SqliteStore::new(pool.clone(), config.db.collection.clone()));
    let embedder = create_embedder(&config.embedding, &secrets)?;
    let retriever = Retriever::new(store, embedder, params)?;
    let results = retriever.retrieve(query).await?;

    if results.is_empty() {
        println!("No results.");
        pool.close().await;
        return Ok(());
    }

    for (i, result) in results.iter().enumerate() {
        println!(
            "{}. [{:.2}] {} (chunk {}/{})",
            i + 1,
            result.similarity,
            result.source_id,
            result.chunk_index + 1,
            result.total_chunks
        );
        println!("    mmr: {:.3}", result.mmr_score);
        println!("    excerpt: \"{}\"", excerpt(&result.text));
        println!();
    }

    pool.close().await;
    Ok(())
}

/// First [`EXCERPT_CHARS`] characters on a single line.
fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excerpt_flattens_and_truncates() {
        assert_eq!(excerpt("a\n\nb   c"), "a b c");
        let long = "é".repeat(300);
        let e = excerpt(&long);
        assert!(e.ends_with("..."));
        assert_eq!(e.chars().count(), EXCERPT_CHARS + 3);
    }
}
