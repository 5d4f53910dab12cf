//! Test doubles for the collaborator traits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ulid::Ulid;

use rag_core::{
    Candidate, ConfidenceScorer, Generator, IndexHit, KeywordIndex, QueryRewriter, RagError,
    RankedResult, Reranker, Result, Source, VectorIndex,
};

use crate::retrieve::CandidateList;

pub fn hits(items: &[(&str, f32)]) -> Vec<IndexHit> {
    items
        .iter()
        .map(|(id, score)| IndexHit::new(id, 0, &format!("text of {}", id), *score))
        .collect()
}

pub fn candidate_list(source: Source, query_sequence: u32, items: &[(&str, f32)]) -> CandidateList {
    let query_id = Ulid::new();
    CandidateList {
        source,
        query_id,
        query_sequence,
        candidates: items
            .iter()
            .map(|(id, score)| Candidate {
                document_id: id.to_string(),
                chunk_index: 0,
                text_preview: format!("text of {}", id),
                text: format!("text of {}", id),
                source,
                raw_score: *score,
                origin_query_id: query_id,
                origin_sequence: query_sequence,
            })
            .collect(),
    }
}

/// Returns its whole hit list as given, ignoring `top_k` and order. Sorting
/// and truncation are left to the retriever.
pub struct StaticIndex {
    hits: Vec<IndexHit>,
}

impl StaticIndex {
    pub fn new(hits: Vec<IndexHit>) -> Self {
        Self { hits }
    }
}

#[async_trait]
impl VectorIndex for StaticIndex {
    async fn search(&self, _query_text: &str, _top_k: usize) -> Result<Vec<IndexHit>> {
        Ok(self.hits.clone())
    }
}

#[async_trait]
impl KeywordIndex for StaticIndex {
    async fn search(&self, _query_text: &str, _top_k: usize) -> Result<Vec<IndexHit>> {
        Ok(self.hits.clone())
    }
}

/// Returns exactly `top_k` distinct hits with descending scores.
pub struct GrowingIndex;

#[async_trait]
impl VectorIndex for GrowingIndex {
    async fn search(&self, _query_text: &str, top_k: usize) -> Result<Vec<IndexHit>> {
        Ok((0..top_k)
            .map(|i| {
                let id = format!("doc-{}", i);
                IndexHit::new(&id, 0, &format!("text of {}", id), 1.0 - i as f32 * 0.01)
            })
            .collect())
    }
}

/// Counts calls. The first `fast_calls` answer at once with `top_k`
/// generated hits; later calls sleep first.
pub struct CountingIndex {
    calls: AtomicUsize,
    fast_calls: usize,
    delay: Duration,
}

impl CountingIndex {
    pub fn new(fast_calls: usize, delay: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fast_calls,
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorIndex for CountingIndex {
    async fn search(&self, _query_text: &str, top_k: usize) -> Result<Vec<IndexHit>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call >= self.fast_calls {
            tokio::time::sleep(self.delay).await;
        }
        Ok((0..top_k)
            .map(|i| {
                let id = format!("doc-{}", i);
                IndexHit::new(&id, 0, &format!("text of {}", id), 1.0 - i as f32 * 0.01)
            })
            .collect())
    }
}

pub struct FailingIndex {
    message: String,
}

impl FailingIndex {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl VectorIndex for FailingIndex {
    async fn search(&self, _query_text: &str, _top_k: usize) -> Result<Vec<IndexHit>> {
        Err(RagError::backend("vector", self.message.clone()))
    }
}

#[async_trait]
impl KeywordIndex for FailingIndex {
    async fn search(&self, _query_text: &str, _top_k: usize) -> Result<Vec<IndexHit>> {
        Err(RagError::backend("keyword", self.message.clone()))
    }
}

/// Sleeps before answering.
pub struct SlowIndex {
    delay: Duration,
    hits: Vec<IndexHit>,
}

impl SlowIndex {
    pub fn new(delay: Duration, hits: Vec<IndexHit>) -> Self {
        Self { delay, hits }
    }

    async fn answer(&self, top_k: usize) -> Vec<IndexHit> {
        tokio::time::sleep(self.delay).await;
        self.hits.iter().take(top_k).cloned().collect()
    }
}

#[async_trait]
impl VectorIndex for SlowIndex {
    async fn search(&self, _query_text: &str, top_k: usize) -> Result<Vec<IndexHit>> {
        Ok(self.answer(top_k).await)
    }
}

#[async_trait]
impl KeywordIndex for SlowIndex {
    async fn search(&self, _query_text: &str, top_k: usize) -> Result<Vec<IndexHit>> {
        Ok(self.answer(top_k).await)
    }
}

/// Returns canned rewrites and parts, ignoring the requested count.
pub struct StaticRewriter {
    rewrites: Vec<String>,
    parts: Vec<String>,
}

impl StaticRewriter {
    pub fn new(rewrites: Vec<&str>, parts: Vec<&str>) -> Self {
        Self {
            rewrites: rewrites.into_iter().map(String::from).collect(),
            parts: parts.into_iter().map(String::from).collect(),
        }
    }
}

#[async_trait]
impl QueryRewriter for StaticRewriter {
    async fn rewrite(&self, _query_text: &str, _n: usize) -> Result<Vec<String>> {
        Ok(self.rewrites.clone())
    }

    async fn decompose(&self, _query_text: &str) -> Result<Vec<String>> {
        Ok(self.parts.clone())
    }
}

/// Fails every call, optionally after a delay.
#[derive(Default)]
pub struct FailingRewriter {
    delay: Option<Duration>,
}

impl FailingRewriter {
    pub fn slow(delay: Duration) -> Self {
        Self { delay: Some(delay) }
    }

    async fn fail(&self) -> Result<Vec<String>> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Err(RagError::internal("rewriter unreachable"))
    }
}

#[async_trait]
impl QueryRewriter for FailingRewriter {
    async fn rewrite(&self, _query_text: &str, _n: usize) -> Result<Vec<String>> {
        self.fail().await
    }

    async fn decompose(&self, _query_text: &str) -> Result<Vec<String>> {
        self.fail().await
    }
}

/// Reports the run as cancelled, as a model client does on shutdown.
pub struct CancelledRewriter;

#[async_trait]
impl QueryRewriter for CancelledRewriter {
    async fn rewrite(&self, _query_text: &str, _n: usize) -> Result<Vec<String>> {
        Err(RagError::Cancelled)
    }

    async fn decompose(&self, _query_text: &str) -> Result<Vec<String>> {
        Err(RagError::Cancelled)
    }
}

pub struct StaticReranker {
    scores: Vec<f32>,
}

impl StaticReranker {
    pub fn new(scores: Vec<f32>) -> Self {
        Self { scores }
    }
}

#[async_trait]
impl Reranker for StaticReranker {
    async fn score(&self, _query_text: &str, _candidates: &[&str]) -> Result<Vec<f32>> {
        Ok(self.scores.clone())
    }
}

pub struct FailingReranker;

#[async_trait]
impl Reranker for FailingReranker {
    async fn score(&self, _query_text: &str, _candidates: &[&str]) -> Result<Vec<f32>> {
        Err(RagError::internal("reranker unreachable"))
    }
}

/// Confidence looked up by result count, so scripted passes stay pure.
pub struct ScriptedScorer {
    by_len: Vec<(usize, f32)>,
}

impl ScriptedScorer {
    pub fn by_len(by_len: &[(usize, f32)]) -> Self {
        Self {
            by_len: by_len.to_vec(),
        }
    }
}

impl ConfidenceScorer for ScriptedScorer {
    fn score(&self, results: &[RankedResult], _list_count: usize) -> f32 {
        self.by_len
            .iter()
            .find(|(len, _)| *len == results.len())
            .map(|(_, confidence)| *confidence)
            .unwrap_or(0.0)
    }
}

pub struct EchoGenerator;

#[async_trait]
impl Generator for EchoGenerator {
    async fn generate(&self, context: &[&str], query_text: &str) -> Result<String> {
        Ok(format!("{} chunk(s) for: {}", context.len(), query_text))
    }
}

pub struct FailingGenerator;

#[async_trait]
impl Generator for FailingGenerator {
    async fn generate(&self, _context: &[&str], _query_text: &str) -> Result<String> {
        Err(RagError::generation("model offline"))
    }
}
