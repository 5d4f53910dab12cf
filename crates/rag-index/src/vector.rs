//! Hashed bag-of-words vector index.

use async_trait::async_trait;

use rag_core::{IndexHit, Result, VectorIndex};

use crate::corpus::{Chunk, Corpus};
use crate::text::content_terms;

/// Deterministic feature-hashing embedder.
///
/// Each content term is hashed with blake3 into one of `dimension` buckets
/// with a hash-derived sign, and the vector is L2 normalized. No model is
/// needed, so results are reproducible across runs.
#[derive(Debug, Clone)]
pub struct HashedEmbedder {
    dimension: usize,
}

impl HashedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn embed(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimension];
        for term in content_terms(text) {
            let hash = blake3::hash(term.as_bytes());
            let bytes = hash.as_bytes();
            let mut word = [0u8; 8];
            word.copy_from_slice(&bytes[..8]);
            let value = u64::from_le_bytes(word);
            let bucket = (value % self.dimension as u64) as usize;
            let sign = if bytes[8] & 1 == 0 { 1.0 } else { -1.0 };
            embedding[bucket] += sign;
        }

        // L2 normalize
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut embedding {
                *x /= norm;
            }
        }
        embedding
    }
}

impl Default for HashedEmbedder {
    fn default() -> Self {
        Self::new(512)
    }
}

/// Brute-force cosine similarity search over embedded chunks.
pub struct HashedVectorIndex {
    embedder: HashedEmbedder,
    chunks: Vec<Chunk>,
    embeddings: Vec<Vec<f32>>,
}

impl HashedVectorIndex {
    pub fn new(corpus: &Corpus, embedder: HashedEmbedder) -> Self {
        let chunks = corpus.chunks().to_vec();
        let embeddings = chunks.iter().map(|c| embedder.embed(&c.text)).collect();
        Self {
            embedder,
            chunks,
            embeddings,
        }
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait]
impl VectorIndex for HashedVectorIndex {
    async fn search(&self, query_text: &str, top_k: usize) -> Result<Vec<IndexHit>> {
        let query = self.embedder.embed(query_text);

        let mut scored: Vec<(usize, f32)> = self
            .embeddings
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine(&query, e)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(top_k);

        Ok(scored
            .into_iter()
            .map(|(i, score)| {
                let chunk = &self.chunks[i];
                IndexHit::new(&chunk.document_id, chunk.chunk_index, &chunk.text, score)
            })
            .collect())
    }
}

/// Dot product of two normalized vectors.
fn cosine(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Corpus {
        Corpus::from_documents([
            ("france.md", "Paris is the capital of France.\n\nFrance exports wine and cheese."),
            ("rust.md", "Rust ownership prevents data races.\n\nThe borrow checker enforces lifetimes."),
        ])
    }

    #[test]
    fn test_embedding_normalized_and_deterministic() {
        let embedder = HashedEmbedder::new(64);
        let a = embedder.embed("capital of France");
        let b = embedder.embed("capital of France");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 0.01);
        assert!(embedder.embed("the of is").iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn test_search_ranks_relevant_chunk_first() {
        let index = HashedVectorIndex::new(&corpus(), HashedEmbedder::default());
        assert_eq!(index.len(), 4);

        let hits = index.search("capital of France", 2).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits.len() <= 2);
        assert_eq!(hits[0].document_id, "france.md");
        assert_eq!(hits[0].chunk_index, 0);
        for pair in hits.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn test_unrelated_query_is_empty() {
        let index = HashedVectorIndex::new(&corpus(), HashedEmbedder::default());
        let hits = index.search("the of is", 5).await.unwrap();
        assert!(hits.is_empty());
    }
}
