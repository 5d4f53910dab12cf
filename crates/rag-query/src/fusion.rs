//! Score fusion and reranking of candidate lists.

use std::collections::{HashMap, HashSet};

use rag_core::{ChunkKey, RagError, RankedResult, Reranker, Result, Source};

use crate::retrieve::CandidateList;

/// Spread below which a list is treated as having identical scores.
const MIN_SPREAD: f32 = 1e-9;

/// Min-max normalize each list to `[0, 1]` and sum the normalized scores of
/// chunks that appear in several lists.
///
/// Lists are visited in rewritten-query order, then input order, and that
/// first-seen order breaks ties between equal fused scores. A list whose
/// scores are all equal normalizes to 1.0. Output is truncated to
/// `max_results` and ranked from 1.
pub fn fuse(lists: &[CandidateList], max_results: usize) -> Vec<RankedResult> {
    let mut order: Vec<&CandidateList> = lists.iter().collect();
    order.sort_by_key(|l| l.query_sequence);

    let mut positions: HashMap<ChunkKey, usize> = HashMap::new();
    let mut merged: Vec<RankedResult> = Vec::new();

    for list in order {
        let (min, max) = score_range(list);
        let spread = max - min;
        let mut seen_in_list: HashSet<ChunkKey> = HashSet::new();

        for candidate in &list.candidates {
            let key = candidate.key();
            if !seen_in_list.insert(key.clone()) {
                continue;
            }

            let normalized = if !candidate.raw_score.is_finite() {
                0.0
            } else if spread > MIN_SPREAD {
                ((candidate.raw_score - min) / spread).clamp(0.0, 1.0)
            } else {
                1.0
            };

            match positions.get(&key) {
                Some(&idx) => {
                    let entry = &mut merged[idx];
                    entry.fused_score += normalized;
                    if !entry.sources.contains(&list.source) {
                        entry.sources.push(list.source);
                    }
                }
                None => {
                    positions.insert(key, merged.len());
                    merged.push(RankedResult {
                        candidate: candidate.clone(),
                        sources: vec![list.source],
                        fused_score: normalized,
                        rerank_score: None,
                        final_rank: 0,
                    });
                }
            }
        }
    }

    // Stable sort keeps first-seen order among equal scores.
    merged.sort_by(|a, b| {
        b.fused_score
            .partial_cmp(&a.fused_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged.truncate(max_results);
    assign_ranks(&mut merged);
    merged
}

fn score_range(list: &CandidateList) -> (f32, f32) {
    list.candidates
        .iter()
        .map(|c| c.raw_score)
        .filter(|s| s.is_finite())
        .fold(None, |acc: Option<(f32, f32)>, s| match acc {
            Some((lo, hi)) => Some((lo.min(s), hi.max(s))),
            None => Some((s, s)),
        })
        .unwrap_or((0.0, 0.0))
}

/// Re-score fused results with an external reranker and order them by
/// rerank score. Ties keep fused order. Fused scores are retained.
pub async fn rerank(
    reranker: &dyn Reranker,
    query_text: &str,
    mut results: Vec<RankedResult>,
    max_results: usize,
) -> Result<Vec<RankedResult>> {
    if results.is_empty() {
        return Ok(results);
    }

    let texts: Vec<&str> = results
        .iter()
        .map(|r| {
            if r.candidate.text.is_empty() {
                r.candidate.text_preview.as_str()
            } else {
                r.candidate.text.as_str()
            }
        })
        .collect();

    let scores = reranker
        .score(query_text, &texts)
        .await
        .map_err(|e| RagError::rerank(e.to_string()))?;

    if scores.len() != results.len() {
        return Err(RagError::rerank(format!(
            "reranker returned {} scores for {} candidates",
            scores.len(),
            results.len()
        )));
    }

    for (result, score) in results.iter_mut().zip(scores) {
        result.rerank_score = Some(if score.is_finite() { score } else { f32::MIN });
    }

    results.sort_by(|a, b| {
        b.ranking_score()
            .partial_cmp(&a.ranking_score())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    results.truncate(max_results);
    assign_ranks(&mut results);
    Ok(results)
}

/// Truncate and rank fused results when no rerank pass applies.
pub fn truncate_fused(mut results: Vec<RankedResult>, max_results: usize) -> Vec<RankedResult> {
    results.truncate(max_results);
    assign_ranks(&mut results);
    results
}

fn assign_ranks(results: &mut [RankedResult]) {
    for (i, result) in results.iter_mut().enumerate() {
        result.final_rank = i as u32 + 1;
    }
}

/// Backends contributing to any result.
pub fn contributing_sources(results: &[RankedResult]) -> Vec<Source> {
    let mut sources: Vec<Source> = results.iter().flat_map(|r| r.sources.clone()).collect();
    sources.sort();
    sources.dedup();
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{candidate_list, FailingReranker, StaticReranker};

    fn assert_ranked(results: &[RankedResult]) {
        for (i, r) in results.iter().enumerate() {
            assert_eq!(r.final_rank, i as u32 + 1);
        }
        for pair in results.windows(2) {
            assert!(pair[0].fused_score >= pair[1].fused_score);
        }
    }

    #[test]
    fn test_min_max_normalization() {
        let lists = vec![candidate_list(
            Source::Vector,
            0,
            &[("paris", 0.9), ("lyon", 0.6), ("nice", 0.4)],
        )];
        let fused = fuse(&lists, 10);

        let ids: Vec<_> = fused.iter().map(|r| r.candidate.document_id.as_str()).collect();
        assert_eq!(ids, vec!["paris", "lyon", "nice"]);
        assert!((fused[0].fused_score - 1.0).abs() < 1e-6);
        assert!((fused[1].fused_score - 0.4).abs() < 1e-5);
        assert!(fused[2].fused_score.abs() < 1e-6);
        assert_eq!(
            fused.iter().map(|r| r.final_rank).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_cross_backend_dedup_sums_scores() {
        let lists = vec![
            candidate_list(Source::Vector, 0, &[("a", 0.9), ("b", 0.5)]),
            candidate_list(Source::Keyword, 0, &[("b", 12.0), ("c", 3.0)]),
        ];
        let fused = fuse(&lists, 10);

        assert_eq!(fused.len(), 3);
        let b: Vec<_> = fused
            .iter()
            .filter(|r| r.candidate.document_id == "b")
            .collect();
        assert_eq!(b.len(), 1);
        assert!((b[0].fused_score - 1.0).abs() < 1e-6);
        assert_eq!(b[0].sources, vec![Source::Vector, Source::Keyword]);
        assert_ranked(&fused);
    }

    #[test]
    fn test_tie_break_prefers_first_seen() {
        // Keyword list for query 0 comes after the vector list for query 1 in
        // the input, but query order wins.
        let lists = vec![
            candidate_list(Source::Vector, 1, &[("late", 5.0)]),
            candidate_list(Source::Keyword, 0, &[("early", 2.0)]),
        ];
        let fused = fuse(&lists, 10);
        assert_eq!(fused[0].candidate.document_id, "early");
        assert_eq!(fused[1].candidate.document_id, "late");
    }

    #[test]
    fn test_duplicate_within_list_counted_once() {
        let lists = vec![candidate_list(
            Source::Vector,
            0,
            &[("a", 1.0), ("a", 1.0), ("b", 0.0)],
        )];
        let fused = fuse(&lists, 10);
        assert_eq!(fused.len(), 2);
        assert!((fused[0].fused_score - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_truncation_drops_lowest() {
        let lists = vec![candidate_list(
            Source::Vector,
            0,
            &[("a", 0.9), ("b", 0.8), ("c", 0.7), ("d", 0.1)],
        )];
        let fused = fuse(&lists, 2);
        let ids: Vec<_> = fused.iter().map(|r| r.candidate.document_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_fuse_is_idempotent() {
        let lists = vec![
            candidate_list(Source::Vector, 0, &[("a", 0.3), ("b", 0.3), ("c", 0.9)]),
            candidate_list(Source::Keyword, 0, &[("c", 1.0), ("d", 7.0), ("a", 7.0)]),
            candidate_list(Source::Vector, 1, &[("e", 0.5), ("a", 0.2)]),
        ];
        let first = fuse(&lists, 10);
        let second = fuse(&lists, 10);
        assert_eq!(first, second);
        assert_ranked(&first);
    }

    #[test]
    fn test_empty_and_non_finite_scores() {
        assert!(fuse(&[], 10).is_empty());
        let lists = vec![candidate_list(
            Source::Vector,
            0,
            &[("a", f32::NAN), ("b", 0.5), ("c", 0.1)],
        )];
        let fused = fuse(&lists, 10);
        assert_eq!(fused[0].candidate.document_id, "b");
        assert_ranked(&fused);
    }

    #[tokio::test]
    async fn test_rerank_reorders_and_keeps_fused_score() {
        let lists = vec![candidate_list(
            Source::Vector,
            0,
            &[("a", 0.9), ("b", 0.6), ("c", 0.4)],
        )];
        let fused = fuse(&lists, 10);
        let reranker = StaticReranker::new(vec![0.1, 0.2, 0.9]);

        let reranked = rerank(&reranker, "q", fused, 2).await.unwrap();
        assert_eq!(reranked.len(), 2);
        assert_eq!(reranked[0].candidate.document_id, "c");
        assert_eq!(reranked[0].rerank_score, Some(0.9));
        assert!(reranked[0].fused_score.abs() < 1e-6);
        assert_eq!(reranked[0].final_rank, 1);
        assert_eq!(reranked[1].candidate.document_id, "b");
    }

    #[tokio::test]
    async fn test_rerank_failure_and_mismatch() {
        let lists = vec![candidate_list(Source::Vector, 0, &[("a", 0.9), ("b", 0.6)])];
        let fused = fuse(&lists, 10);

        let err = rerank(&FailingReranker, "q", fused.clone(), 10)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RERANK_UNAVAILABLE");

        let short = StaticReranker::new(vec![0.5]);
        let err = rerank(&short, "q", fused, 10).await.unwrap_err();
        assert!(err.to_string().contains("1 scores for 2 candidates"));
    }

    #[test]
    fn test_contributing_sources() {
        let lists = vec![
            candidate_list(Source::Keyword, 0, &[("a", 1.0)]),
            candidate_list(Source::Vector, 0, &[("b", 1.0)]),
        ];
        let fused = fuse(&lists, 10);
        assert_eq!(
            contributing_sources(&fused),
            vec![Source::Vector, Source::Keyword]
        );
    }
}
