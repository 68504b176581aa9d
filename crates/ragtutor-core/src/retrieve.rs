//! Diversity-aware retrieval with Maximal Marginal Relevance.
//!
//! The retriever oversamples `fetch_k` candidates by raw cosine similarity
//! and then picks `k` of them greedily, each step maximizing
//!
//! ```text
//! λ · sim(query, c) − (1 − λ) · max_{s ∈ selected} sim(c, s)
//! ```
//!
//! The redundancy term is zero while nothing is selected. Ties go to the
//! candidate with the higher raw query similarity, then to the earlier one.
//!
//! - `λ = 1`: plain similarity ranking.
//! - `λ = 0`: after the first (most similar) pick, each step takes the
//!   candidate least similar to anything already chosen.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::embedding::{cosine_similarity, embed_query, Embedder};
use crate::models::ScoredChunk;
use crate::store::IndexStore;

const TIE_EPSILON: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MmrParams {
    /// Results returned.
    pub k: usize,
    /// Candidates fetched by raw similarity before re-ranking.
    pub fetch_k: usize,
    /// Relevance weight in `[0, 1]`.
    pub lambda: f32,
}

impl Default for MmrParams {
    fn default() -> Self {
        Self {
            k: 4,
            fetch_k: 10,
            lambda: 0.5,
        }
    }
}

impl MmrParams {
    pub fn validate(&self) -> Result<()> {
        if self.k == 0 {
            bail!("retrieval.k must be >= 1");
        }
        if self.fetch_k < self.k {
            bail!(
                "retrieval.fetch_k ({}) must be >= retrieval.k ({})",
                self.fetch_k,
                self.k
            );
        }
        if !(0.0..=1.0).contains(&self.lambda) {
            bail!("retrieval.lambda must be within [0, 1], got {}", self.lambda);
        }
        Ok(())
    }
}

/// A chunk chosen by the retriever.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub source_id: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: String,
    /// Cosine similarity to the query.
    pub similarity: f32,
    /// MMR score at the step the chunk was selected.
    pub mmr_score: f32,
}

/// Greedy MMR selection over `candidates`, returning `(candidate index, score)`
/// in selection order.
///
/// `candidates[i].similarity` must already hold `sim(query, candidates[i])`.
pub fn mmr_select(candidates: &[ScoredChunk], k: usize, lambda: f32) -> Vec<(usize, f32)> {
    let k = k.min(candidates.len());
    let mut selected: Vec<(usize, f32)> = Vec::with_capacity(k);
    let mut remaining: Vec<usize> = (0..candidates.len()).collect();

    while selected.len() < k {
        let mut best: Option<(usize, f32)> = None;

        for (pos, &idx) in remaining.iter().enumerate() {
            let candidate = &candidates[idx];
            let redundancy = selected
                .iter()
                .map(|(s, _)| cosine_similarity(&candidate.vector, &candidates[*s].vector))
                .fold(None, |acc: Option<f32>, sim| Some(acc.map_or(sim, |a| a.max(sim))))
                .unwrap_or(0.0);
            let score = lambda * candidate.similarity - (1.0 - lambda) * redundancy;

            let better = match best {
                None => true,
                Some((best_pos, best_score)) => {
                    if score > best_score + TIE_EPSILON {
                        true
                    } else if (score - best_score).abs() <= TIE_EPSILON {
                        candidate.similarity > candidates[remaining[best_pos]].similarity
                    } else {
                        false
                    }
                }
            };
            if better {
                best = Some((pos, score));
            }
        }

        let Some((pos, score)) = best else {
            break;
        };
        selected.push((remaining.remove(pos), score));
    }

    selected
}

/// Embeds a query, fetches candidates, and re-ranks them with MMR.
#[derive(Clone)]
pub struct Retriever {
    store: Arc<dyn IndexStore>,
    embedder: Arc<dyn Embedder>,
    params: MmrParams,
}

impl Retriever {
    pub fn new(
        store: Arc<dyn IndexStore>,
        embedder: Arc<dyn Embedder>,
        params: MmrParams,
    ) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            store,
            embedder,
            params,
        })
    }

    pub fn params(&self) -> MmrParams {
        self.params
    }

    pub async fn retrieve(&self, query: &str) -> Result<Vec<RetrievedChunk>> {
        let query_vec = embed_query(self.embedder.as_ref(), query)
            .await
            .context("failed to embed query")?;
        let candidates = self
            .store
            .similarity_search(&query_vec, self.embedder.model_name(), self.params.fetch_k)
            .await
            .context("similarity search failed")?;

        Ok(mmr_select(&candidates, self.params.k, self.params.lambda)
            .into_iter()
            .map(|(idx, score)| {
                let c = &candidates[idx];
                RetrievedChunk {
                    source_id: c.source_id.clone(),
                    chunk_index: c.chunk_index,
                    total_chunks: c.total_chunks,
                    text: c.text.clone(),
                    similarity: c.similarity,
                    mmr_score: score,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;

    use crate::models::IndexRecord;
    use crate::store::memory::InMemoryStore;

    fn candidate(id: &str, query: &[f32], vector: Vec<f32>) -> ScoredChunk {
        ScoredChunk {
            fingerprint: id.to_string(),
            source_id: "s".to_string(),
            chunk_index: 0,
            total_chunks: 1,
            text: id.to_string(),
            similarity: cosine_similarity(query, &vector),
            vector,
        }
    }

    /// `top` and its near-duplicate `dup` are most similar to the query;
    /// `far` is less relevant and orthogonal to `top`.
    fn pool() -> (Vec<f32>, Vec<ScoredChunk>) {
        let q = vec![1.0, 0.0, 0.5];
        let c = vec![
            candidate("top", &q, vec![1.0, 0.0, 0.0]),
            candidate("dup", &q, vec![0.99, 0.14, 0.0]),
            candidate("far", &q, vec![0.0, 0.0, 1.0]),
        ];
        (q, c)
    }

    fn order(candidates: &[ScoredChunk], picks: &[(usize, f32)]) -> Vec<String> {
        picks
            .iter()
            .map(|(i, _)| candidates[*i].fingerprint.clone())
            .collect()
    }

    #[test]
    fn test_lambda_one_is_similarity_order() {
        let (_, c) = pool();
        assert_eq!(order(&c, &mmr_select(&c, 3, 1.0)), vec!["top", "dup", "far"]);
    }

    #[test]
    fn test_lambda_zero_prefers_diversity() {
        let (_, c) = pool();
        let picks = order(&c, &mmr_select(&c, 3, 0.0));
        assert_eq!(picks[0], "top");
        assert_eq!(picks[1], "far");
        assert_eq!(picks[2], "dup");
    }

    #[test]
    fn test_balanced_skips_near_duplicate() {
        let (_, c) = pool();
        let picks = order(&c, &mmr_select(&c, 2, 0.5));
        assert_eq!(picks, vec!["top", "far"]);
    }

    #[test]
    fn test_tie_goes_to_higher_similarity() {
        let q = vec![1.0, 0.0];
        // listed least-similar first so candidate order alone would pick it
        let c = vec![
            candidate("low", &q, vec![0.6, 0.8]),
            candidate("high", &q, vec![0.8, 0.6]),
        ];
        let picks = order(&c, &mmr_select(&c, 1, 0.0));
        assert_eq!(picks, vec!["high"]);
    }

    #[test]
    fn test_k_larger_than_pool() {
        let (_, c) = pool();
        assert_eq!(mmr_select(&c, 10, 0.5).len(), 3);
        assert!(mmr_select(&[], 4, 0.5).is_empty());
    }

    #[test]
    fn test_params_validation() {
        assert!(MmrParams::default().validate().is_ok());
        let bad_k = MmrParams { k: 0, ..MmrParams::default() };
        assert!(bad_k.validate().is_err());
        let bad_fetch = MmrParams { k: 5, fetch_k: 3, lambda: 0.5 };
        assert!(bad_fetch.validate().is_err());
        let bad_lambda = MmrParams { lambda: 1.5, ..MmrParams::default() };
        assert!(bad_lambda.validate().is_err());
    }

    /// Maps text onto a few keyword axes.
    struct KeywordEmbedder;

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn model_name(&self) -> &str {
            "keywords"
        }

        fn dims(&self) -> usize {
            3
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| {
                    let t = t.to_lowercase();
                    vec![
                        t.matches("binary search").count() as f32 + 0.01,
                        t.matches("hash").count() as f32 + 0.01,
                        t.matches("graph").count() as f32 + 0.01,
                    ]
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn test_retrieve_ranks_matching_chunk_first() {
        let store = Arc::new(InMemoryStore::new());
        let embedder = Arc::new(KeywordEmbedder);
        let texts = [
            "Hash tables give O(1) average lookups.",
            "Binary search runs in O(log n) time.",
            "Graph traversal visits every vertex.",
        ];
        let vectors = embedder
            .embed(&texts.iter().map(|t| t.to_string()).collect::<Vec<_>>())
            .await
            .unwrap();
        for (i, (text, vector)) in texts.iter().zip(vectors).enumerate() {
            store
                .upsert(&IndexRecord {
                    fingerprint: format!("fp{}", i),
                    source_id: "notes.md".to_string(),
                    vector,
                    last_synced_at: Utc::now(),
                    text: text.to_string(),
                    chunk_index: i,
                    total_chunks: texts.len(),
                    model: "keywords".to_string(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let retriever = Retriever::new(
            store,
            embedder,
            MmrParams { k: 1, fetch_k: 10, lambda: 0.5 },
        )
        .unwrap();
        let hits = retriever
            .retrieve("What is the time complexity of binary search?")
            .await
            .unwrap();

        assert_eq!(hits.len(), 1);
        assert!(hits[0].text.contains("Binary search runs in O(log n) time."));
    }
}
