//! Core traits defining the interfaces to external collaborators.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{IterationRecord, Query, RankedResult, Strategy};

/// A raw hit returned by an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub document_id: String,

    /// Index within the document (0-based).
    pub chunk_index: u32,

    /// Full chunk text.
    pub text: String,

    /// Index-specific relevance score (higher is better).
    pub score: f32,
}

impl IndexHit {
    pub fn new(document_id: &str, chunk_index: u32, text: &str, score: f32) -> Self {
        Self {
            document_id: document_id.to_string(),
            chunk_index,
            text: text.to_string(),
            score,
        }
    }
}

/// Embedding-backed similarity index.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `top_k` hits by descending similarity.
    async fn search(&self, query_text: &str, top_k: usize) -> Result<Vec<IndexHit>>;
}

/// Full-text keyword index.
#[async_trait]
pub trait KeywordIndex: Send + Sync {
    /// Return up to `top_k` hits by descending lexical score.
    async fn search(&self, query_text: &str, top_k: usize) -> Result<Vec<IndexHit>>;
}

/// Cross-encoder style reranking model.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Score each candidate text against the query. Output is parallel to `candidates`.
    async fn score(&self, query_text: &str, candidates: &[&str]) -> Result<Vec<f32>>;
}

/// Query rewriting model.
#[async_trait]
pub trait QueryRewriter: Send + Sync {
    /// Produce up to `n` reformulations of the query.
    async fn rewrite(&self, query_text: &str, n: usize) -> Result<Vec<String>>;

    /// Split a multi-part query into sub-queries.
    async fn decompose(&self, query_text: &str) -> Result<Vec<String>>;
}

/// Answer generation model.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, context: &[&str], query_text: &str) -> Result<String>;
}

/// Confidence estimate for one pass of ranked results.
///
/// Implementations must be pure and return a value in `[0, 1]`.
pub trait ConfidenceScorer: Send + Sync {
    /// `list_count` is the number of candidate lists fused into `results`.
    fn score(&self, results: &[RankedResult], list_count: usize) -> f32;
}

/// Chooses a retrieval strategy for a query.
///
/// Implementations must be deterministic for identical inputs.
pub trait StrategyClassifier: Send + Sync {
    fn select(&self, query: &Query, history: &[IterationRecord]) -> Strategy;
}
