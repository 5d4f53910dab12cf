//! Term-overlap reranker.

use async_trait::async_trait;

use rag_core::{Reranker, Result};

use crate::text::{content_terms, term_set};

/// Scores each candidate by the share of query terms it contains, plus a
/// bonus for query term pairs that appear adjacent in the candidate.
#[derive(Debug, Clone)]
pub struct OverlapReranker {
    pub phrase_bonus: f32,
}

impl Default for OverlapReranker {
    fn default() -> Self {
        Self { phrase_bonus: 0.5 }
    }
}

#[async_trait]
impl Reranker for OverlapReranker {
    async fn score(&self, query_text: &str, candidates: &[&str]) -> Result<Vec<f32>> {
        let query_terms = content_terms(query_text);
        let distinct = term_set(query_text);
        if distinct.is_empty() {
            return Ok(vec![0.0; candidates.len()]);
        }
        let pairs: Vec<String> = query_terms.windows(2).map(|p| p.join(" ")).collect();

        Ok(candidates
            .iter()
            .map(|text| {
                let terms = content_terms(text);
                let joined = format!(" {} ", terms.join(" "));
                let covered = distinct.iter().filter(|t| terms.contains(t)).count();
                let coverage = covered as f32 / distinct.len() as f32;
                let phrases = pairs
                    .iter()
                    .filter(|p| joined.contains(&format!(" {} ", p)))
                    .count();
                let phrase_share = if pairs.is_empty() {
                    0.0
                } else {
                    phrases as f32 / pairs.len() as f32
                };
                coverage + self.phrase_bonus * phrase_share
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scores_align_with_candidates() {
        let reranker = OverlapReranker::default();
        let scores = reranker
            .score(
                "borrow checker rules",
                &["The borrow checker has rules.", "Rules of chess.", "Nothing here."],
            )
            .await
            .unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores[0] > scores[1]);
        assert!(scores[1] > scores[2]);
        assert_eq!(scores[2], 0.0);
    }

    #[tokio::test]
    async fn test_adjacent_terms_score_higher() {
        let reranker = OverlapReranker::default();
        let scores = reranker
            .score("borrow checker", &["checker of borrow", "the borrow checker"])
            .await
            .unwrap();
        assert!(scores[1] > scores[0]);
    }
}
