//! Query rewriting, expansion and decomposition.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use rag_core::{
    Query, QueryRewriter, RagError, Result, RewriteKind, RewrittenQuery, TransformConfig,
};

/// How the transformer derives retrieval queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    /// The raw query only.
    Passthrough,
    /// Semantically equivalent reformulations.
    Rewrite,
    /// Ordered sub-queries covering the original information need.
    Decompose,
}

impl std::fmt::Display for TransformMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Passthrough => "passthrough",
            Self::Rewrite => "rewrite",
            Self::Decompose => "decompose",
        };
        write!(f, "{}", s)
    }
}

/// Derives [`RewrittenQuery`] sets from a [`Query`].
///
/// Without a rewriter every mode degrades to passthrough. With one, a
/// failing or slow rewriter surfaces as [`RagError::TransformUnavailable`] so
/// the caller can decide on the fallback.
pub struct QueryTransformer {
    rewriter: Option<Arc<dyn QueryRewriter>>,
    config: TransformConfig,
}

impl QueryTransformer {
    pub fn new(rewriter: Option<Arc<dyn QueryRewriter>>, config: TransformConfig) -> Self {
        Self { rewriter, config }
    }

    /// Derive retrieval queries for `mode`, ordered by `sequence_index`.
    pub async fn transform(&self, query: &Query, mode: TransformMode) -> Result<Vec<RewrittenQuery>> {
        let Some(rewriter) = &self.rewriter else {
            return Ok(vec![RewrittenQuery::passthrough(query)]);
        };

        let (texts, kind) = match mode {
            TransformMode::Passthrough => return Ok(vec![RewrittenQuery::passthrough(query)]),
            TransformMode::Rewrite => {
                let n = self.config.rewrite_count.clamp(1, self.max_rewrites());
                let texts = self.call(rewriter.rewrite(&query.raw_text, n)).await?;
                (clean(texts, None, n), RewriteKind::Rewrite)
            }
            TransformMode::Decompose => {
                let texts = self.call(rewriter.decompose(&query.raw_text)).await?;
                let parts = clean(texts, None, self.max_rewrites());
                // A single part is the query itself.
                if parts.len() < 2 {
                    debug!("Decomposition produced {} part(s), passing through", parts.len());
                    return Ok(vec![RewrittenQuery::passthrough(query)]);
                }
                (parts, RewriteKind::DecompositionPart)
            }
        };

        if texts.is_empty() {
            debug!("Rewriter returned no usable text, passing through");
            return Ok(vec![RewrittenQuery::passthrough(query)]);
        }

        Ok(texts
            .iter()
            .enumerate()
            .map(|(i, text)| RewrittenQuery::new(query, text, kind, i as u32))
            .collect())
    }

    /// Derive queries for a later self-refinement pass: the original query
    /// followed by expansions, more of them on each pass.
    pub async fn reformulate(&self, query: &Query, pass: u32) -> Result<Vec<RewrittenQuery>> {
        let mut queries = vec![RewrittenQuery::passthrough(query)];
        let Some(rewriter) = &self.rewriter else {
            return Ok(queries);
        };

        let n = (self.config.rewrite_count + pass as usize).clamp(1, self.max_rewrites());
        let texts = self.call(rewriter.rewrite(&query.raw_text, n)).await?;
        for (i, text) in clean(texts, Some(&query.raw_text), n).iter().enumerate() {
            queries.push(RewrittenQuery::new(
                query,
                text,
                RewriteKind::Expansion,
                i as u32 + 1,
            ));
        }
        Ok(queries)
    }

    /// Output cap, at least one query.
    fn max_rewrites(&self) -> usize {
        self.config.max_rewrites.max(1)
    }

    /// Bound a rewriter call by the configured timeout.
    async fn call<F>(&self, fut: F) -> Result<Vec<String>>
    where
        F: Future<Output = Result<Vec<String>>>,
    {
        match tokio::time::timeout(self.config.timeout(), fut).await {
            Ok(Ok(texts)) => Ok(texts),
            Ok(Err(RagError::Cancelled)) => Err(RagError::Cancelled),
            Ok(Err(e)) => Err(RagError::transform(e.to_string())),
            Err(_) => Err(RagError::transform(format!(
                "rewriter timed out after {}ms",
                self.config.timeout_ms
            ))),
        }
    }
}

/// Trim, drop blanks and case-insensitive duplicates, optionally drop the
/// original text, and cap the count.
fn clean(texts: Vec<String>, exclude: Option<&str>, cap: usize) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    if let Some(original) = exclude {
        seen.insert(original.trim().to_lowercase());
    }

    texts
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .filter(|t| seen.insert(t.to_lowercase()))
        .take(cap)
        .collect()
}
