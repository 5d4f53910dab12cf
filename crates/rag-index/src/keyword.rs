//! BM25 keyword index.

use std::collections::HashMap;

use async_trait::async_trait;

use rag_core::{IndexHit, KeywordIndex, Result};

use crate::corpus::{Chunk, Corpus};
use crate::text::content_terms;

const K1: f32 = 1.2;
const B: f32 = 0.75;

struct Posting {
    term_counts: HashMap<String, u32>,
    length: usize,
}

/// Okapi BM25 over chunk content terms. Scores are unbounded and only
/// comparable within one result list.
pub struct Bm25Index {
    chunks: Vec<Chunk>,
    postings: Vec<Posting>,
    document_frequency: HashMap<String, usize>,
    average_length: f32,
}

impl Bm25Index {
    pub fn new(corpus: &Corpus) -> Self {
        let chunks = corpus.chunks().to_vec();
        let mut document_frequency: HashMap<String, usize> = HashMap::new();

        let postings: Vec<Posting> = chunks
            .iter()
            .map(|chunk| {
                let terms = content_terms(&chunk.text);
                let mut term_counts: HashMap<String, u32> = HashMap::new();
                for term in &terms {
                    *term_counts.entry(term.clone()).or_default() += 1;
                }
                for term in term_counts.keys() {
                    *document_frequency.entry(term.clone()).or_default() += 1;
                }
                Posting {
                    term_counts,
                    length: terms.len(),
                }
            })
            .collect();

        let total: usize = postings.iter().map(|p| p.length).sum();
        let average_length = if postings.is_empty() {
            0.0
        } else {
            total as f32 / postings.len() as f32
        };

        Self {
            chunks,
            postings,
            document_frequency,
            average_length,
        }
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.postings.len() as f32;
        let df = self.document_frequency.get(term).copied().unwrap_or(0) as f32;
        ((n - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn score(&self, posting: &Posting, query_terms: &[String]) -> f32 {
        let length_ratio = if self.average_length > 0.0 {
            posting.length as f32 / self.average_length
        } else {
            0.0
        };

        query_terms
            .iter()
            .map(|term| {
                let tf = posting.term_counts.get(term).copied().unwrap_or(0) as f32;
                if tf == 0.0 {
                    return 0.0;
                }
                self.idf(term) * (tf * (K1 + 1.0)) / (tf + K1 * (1.0 - B + B * length_ratio))
            })
            .sum()
    }
}

#[async_trait]
impl KeywordIndex for Bm25Index {
    async fn search(&self, query_text: &str, top_k: usize) -> Result<Vec<IndexHit>> {
        let mut query_terms = content_terms(query_text);
        query_terms.sort();
        query_terms.dedup();

        let mut scored: Vec<(usize, f32)> = self
            .postings
            .iter()
            .enumerate()
            .map(|(i, p)| (i, self.score(p, &query_terms)))
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
