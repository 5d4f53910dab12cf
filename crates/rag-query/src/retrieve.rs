//! Retrieval backends and concurrent fan-out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::json;
use tracing::{debug, warn};
use ulid::Ulid;

use rag_core::{
    Candidate, IndexHit, KeywordIndex, RagError, Result, RewrittenQuery, Source, VectorIndex,
};

use crate::trace::Emitter;

/// A retrieval backend producing scored candidates for one rewritten query.
#[async_trait]
pub trait Retriever: Send + Sync {
    fn source(&self) -> Source;

    /// Return at most `top_k` candidates by descending raw score. An empty
    /// result is not an error.
    async fn retrieve(&self, query: &RewrittenQuery, top_k: usize) -> Result<Vec<Candidate>>;
}

/// Retriever over a vector similarity index.
pub struct VectorRetriever {
    index: Arc<dyn VectorIndex>,
    preview_chars: usize,
}

impl VectorRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, preview_chars: usize) -> Self {
        Self {
            index,
            preview_chars,
        }
    }
}

#[async_trait]
impl Retriever for VectorRetriever {
    fn source(&self) -> Source {
        Source::Vector
    }

    async fn retrieve(&self, query: &RewrittenQuery, top_k: usize) -> Result<Vec<Candidate>> {
        check_top_k(top_k)?;
        let hits = self
            .index
            .search(&query.text, top_k)
            .await
            .map_err(|e| RagError::backend(Source::Vector.as_str(), e.to_string()))?;
        Ok(to_candidates(hits, Source::Vector, query, top_k, self.preview_chars))
    }
}

/// Retriever over a keyword index.
pub struct KeywordRetriever {
    index: Arc<dyn KeywordIndex>,
    preview_chars: usize,
}

impl KeywordRetriever {
    pub fn new(index: Arc<dyn KeywordIndex>, preview_chars: usize) -> Self {
        Self {
            index,
            preview_chars,
        }
    }
}

#[async_trait]
impl Retriever for KeywordRetriever {
    fn source(&self) -> Source {
        Source::Keyword
    }

    async fn retrieve(&self, query: &RewrittenQuery, top_k: usize) -> Result<Vec<Candidate>> {
        check_top_k(top_k)?;
        let hits = self
            .index
            .search(&query.text, top_k)
            .await
            .map_err(|e| RagError::backend(Source::Keyword.as_str(), e.to_string()))?;
        Ok(to_candidates(hits, Source::Keyword, query, top_k, self.preview_chars))
    }
}

fn check_top_k(top_k: usize) -> Result<()> {
    if top_k == 0 {
        return Err(RagError::invalid_argument("top_k must be at least 1"));
    }
    Ok(())
}

/// Order hits by descending score (stable), cap at `top_k`, and stamp them
/// with the originating query.
fn to_candidates(
    mut hits: Vec<IndexHit>,
    source: Source,
    query: &RewrittenQuery,
    top_k: usize,
    preview_chars: usize,
) -> Vec<Candidate> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    hits.truncate(top_k);

    hits.into_iter()
        .map(|hit| Candidate {
            text_preview: preview(&hit.text, preview_chars),
            document_id: hit.document_id,
            chunk_index: hit.chunk_index,
            text: hit.text,
            source,
            raw_score: hit.score,
            origin_query_id: query.id,
            origin_sequence: query.sequence_index,
        })
        .collect()
}

/// Cut `text` to `max_chars` characters.
fn preview(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Candidates from one backend for one rewritten query.
#[derive(Debug, Clone)]
pub struct CandidateList {
    pub source: Source,
    pub query_id: Ulid,
    pub query_sequence: u32,
    pub candidates: Vec<Candidate>,
}

/// A failed or timed-out backend call.
#[derive(Debug, Clone)]
pub struct BackendFailure {
    pub source: Source,
    pub query_sequence: u32,
    pub message: String,
    pub timed_out: bool,
}

impl std::fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (q{}): {}", self.source, self.query_sequence, self.message)
    }
}

/// Outcome of a fan-out: successful lists in (query, backend) order, plus failures.
#[derive(Debug, Default)]
pub struct FanOut {
    pub lists: Vec<CandidateList>,
    pub failures: Vec<BackendFailure>,
}

impl FanOut {
    /// True when no backend call succeeded.
    pub fn all_failed(&self) -> bool {
        self.lists.is_empty()
    }

    /// Convert total failure into [`RagError::RetrievalFailed`].
    pub fn into_result(self) -> Result<Self> {
        if self.all_failed() {
            return Err(RagError::RetrievalFailed {
                failures: self.failures.iter().map(|f| f.to_string()).collect(),
            });
        }
        Ok(self)
    }
}

/// Query every retriever for every rewritten query concurrently.
///
/// Each call is bounded by `timeout` and recorded as its own stage. The
/// output order depends only on the input order, never on completion order.
pub async fn fan_out(
    retrievers: &[Arc<dyn Retriever>],
    queries: &[RewrittenQuery],
    top_k: usize,
    timeout: Duration,
    emitter: &Emitter,
) -> FanOut {
    let calls = queries.iter().flat_map(|query| {
        retrievers.iter().map(move |retriever| async move {
            let source = retriever.source();
            let stage = emitter.begin(format!("retrieve.{}.q{}", source, query.sequence_index));
            let outcome = tokio::time::timeout(timeout, retriever.retrieve(query, top_k)).await;

            let failure = |message: String, timed_out: bool| BackendFailure {
                source,
                query_sequence: query.sequence_index,
                message,
                timed_out,
            };

            match outcome {
                Ok(Ok(candidates)) => {
                    emitter.end(
                        stage,
                        json!({
                            "backend": source,
                            "query": query.text,
                            "sequence_index": query.sequence_index,
                            "candidates": candidates
                                .iter()
                                .map(|c| json!({
                                    "document_id": c.document_id,
                                    "chunk_index": c.chunk_index,
                                    "raw_score": c.raw_score,
                                }))
                                .collect::<Vec<_>>(),
                        }),
                        Vec::new(),
                    );
                    Ok(CandidateList {
                        source,
                        query_id: query.id,
                        query_sequence: query.sequence_index,
                        candidates,
                    })
                }
                Ok(Err(e)) => {
                    warn!("Backend {} failed for q{}: {}", source, query.sequence_index, e);
                    let message = e.to_string();
                    emitter.end(
                        stage,
                        json!({ "backend": source, "query": query.text, "candidates": [] }),
                        vec![format!("backend unavailable: {}", message)],
                    );
                    Err(failure(message, false))
                }
                Err(_) => {
                    warn!(
                        "Backend {} timed out after {:?} for q{}",
                        source, timeout, query.sequence_index
                    );
                    let message = format!("timed out after {}ms", timeout.as_millis());
                    emitter.end(
                        stage,
                        json!({ "backend": source, "query": query.text, "candidates": [] }),
                        vec![format!("backend unavailable: {}", message)],
                    );
                    Err(failure(message, true))
                }
            }
        })
    });

    let mut fan = FanOut::default();
    for result in join_all(calls).await {
        match result {
            Ok(list) => fan.lists.push(list),
            Err(failure) => fan.failures.push(failure),
        }
    }

    debug!(
        "Fan-out finished: {} list(s), {} failure(s)",
        fan.lists.len(),
        fan.failures.len()
    );
    fan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{hits, FailingIndex, SlowIndex, StaticIndex};
    use rag_core::Query;

    fn vector(index: impl VectorIndex + 'static) -> Arc<dyn Retriever> {
        Arc::new(VectorRetriever::new(Arc::new(index), 240))
    }

    fn keyword(index: impl KeywordIndex + 'static) -> Arc<dyn Retriever> {
        Arc::new(KeywordRetriever::new(Arc::new(index), 240))
    }

    #[tokio::test]
    async fn test_retrieve_orders_and_truncates() {
        let index = StaticIndex::new(hits(&[("a", 0.2), ("b", 0.9), ("c", 0.5)]));
        let query = Query::new("q");
        let rewritten = RewrittenQuery::passthrough(&query);

        let candidates = vector(index).retrieve(&rewritten, 2).await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert!(candidates.iter().all(|c| c.origin_query_id == rewritten.id));
        assert!(candidates.iter().all(|c| c.source == Source::Vector));
    }

    #[tokio::test]
    async fn test_backend_overshooting_top_k_is_trimmed_by_score() {
        let index = StaticIndex::new(hits(&[
            ("a", 0.1),
            ("b", 0.8),
            ("c", 0.3),
            ("d", 0.95),
            ("e", 0.5),
        ]));
        let query = Query::new("q");
        let rewritten = RewrittenQuery::passthrough(&query);

        let candidates = keyword(index).retrieve(&rewritten, 3).await.unwrap();
        let ids: Vec<_> = candidates.iter().map(|c| c.document_id.as_str()).collect();
        assert_eq!(ids, vec!["d", "b", "e"]);
    }

    #[tokio::test]
    async fn test_empty_results_are_not_errors() {
        let query = Query::new("q");
        let rewritten = RewrittenQuery::passthrough(&query);
        let candidates = keyword(StaticIndex::new(vec![]))
            .retrieve(&rewritten, 5)
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn test_zero_top_k_rejected() {
        let query = Query::new("q");
        let rewritten = RewrittenQuery::passthrough(&query);
        let err = vector(StaticIndex::new(vec![]))
            .retrieve(&rewritten, 0)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("héllo wörld", 5), "héllo...");
        assert_eq!(preview("short", 10), "short");
    }

    #[tokio::test]
    async fn test_fan_out_matrix_and_partial_failure() {
        let query = Query::new("q");
        let queries = vec![
            RewrittenQuery::new(&query, "first", rag_core::RewriteKind::DecompositionPart, 0),
            RewrittenQuery::new(&query, "second", rag_core::RewriteKind::DecompositionPart, 1),
        ];
        let retrievers = vec![
            vector(StaticIndex::new(hits(&[("a", 0.9)]))),
            keyword(FailingIndex::new("keyword index offline")),
        ];
        let emitter = Emitter::new(query.id, None, false);

        let fan = fan_out(&retrievers, &queries, 3, Duration::from_secs(1), &emitter).await;
        assert_eq!(fan.lists.len(), 2);
        assert_eq!(fan.failures.len(), 2);
        assert_eq!(fan.lists[0].query_sequence, 0);
        assert_eq!(fan.lists[1].query_sequence, 1);
        assert!(fan.failures.iter().all(|f| f.source == Source::Keyword));

        let trace = emitter.finish();
        assert_eq!(trace.stage_events.len(), 4);
        assert_eq!(trace.stage_events[0].stage_name, "retrieve.vector.q0");
        assert!(trace
            .stage("retrieve.keyword.q1")
            .is_some_and(|e| !e.annotations.is_empty()));
    }

    #[tokio::test]
    async fn test_fan_out_calls_overlap() {
        let query = Query::new("q");
        let queries = vec![
            RewrittenQuery::new(&query, "first", rag_core::RewriteKind::DecompositionPart, 0),
            RewrittenQuery::new(&query, "second", rag_core::RewriteKind::DecompositionPart, 1),
        ];
        let delay = Duration::from_millis(150);
        let retrievers = vec![
            vector(SlowIndex::new(delay, hits(&[("a", 0.9)]))),
            keyword(SlowIndex::new(delay, hits(&[("b", 3.0)]))),
        ];
        let emitter = Emitter::new(query.id, None, false);

        let started = std::time::Instant::now();
        let fan = fan_out(&retrievers, &queries, 3, Duration::from_secs(5), &emitter).await;
        let elapsed = started.elapsed();

        assert_eq!(fan.lists.len(), 4);
        assert!(fan.failures.is_empty());
        // Four sequential calls would take at least 600ms.
        assert!(elapsed < Duration::from_millis(450), "took {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_fan_out_timeout_is_failure() {
        let query = Query::new("q");
        let queries = vec![RewrittenQuery::passthrough(&query)];
        let retrievers = vec![vector(SlowIndex::new(
            Duration::from_millis(500),
            hits(&[("a", 1.0)]),
        ))];
        let emitter = Emitter::new(query.id, None, false);

        let fan = fan_out(&retrievers, &queries, 3, Duration::from_millis(20), &emitter).await;
        assert!(fan.all_failed());
        assert!(fan.failures[0].timed_out);

        let err = fan.into_result().unwrap_err();
        assert_eq!(err.error_code(), "RETRIEVAL_FAILED");
    }
}
