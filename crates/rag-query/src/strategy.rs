//! Heuristic retrieval strategy selection.

use rag_core::{Decision, IterationRecord, Query, Strategy, StrategyClassifier, StrategyConfig};

/// Deterministic strategy selector driven by query shape and loop history.
///
/// In order of precedence:
/// 1. an empty query maps to `vector_only`;
/// 2. a latest pass that asked to retrieve again with confidence below
///    `escalate_below` escalates to `self_refine`;
/// 3. multi-part questions with enough tokens are `decomposed`;
/// 4. long questions go to `self_refine`;
/// 5. short or exact-match looking queries go `hybrid`;
/// 6. everything else is `vector_only`.
pub struct HeuristicSelector {
    config: StrategyConfig,
}

impl HeuristicSelector {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    /// Whether the query contains a multi-part connective or several questions.
    fn is_multi_part(&self, text: &str) -> bool {
        if text.matches('?').count() > 1 || text.contains(';') {
            return true;
        }

        let text_words = words(text);
        let haystack = format!(" {} ", text_words.join(" "));
        self.config.connectives.iter().any(|connective| {
            let needle = words(connective).join(" ");
            !needle.is_empty() && haystack.contains(&format!(" {} ", needle))
        })
    }
}

impl Default for HeuristicSelector {
    fn default() -> Self {
        Self::new(StrategyConfig::default())
    }
}

impl StrategyClassifier for HeuristicSelector {
    fn select(&self, query: &Query, history: &[IterationRecord]) -> Strategy {
        let tokens = query.token_count();
        if tokens == 0 {
            return Strategy::VectorOnly;
        }

        if history.last().is_some_and(|record| {
            record.decision == Decision::RetrieveAgain
                && record.confidence < self.config.escalate_below
        }) {
            return Strategy::SelfRefine;
        }

        let text = query.raw_text.as_str();
        if tokens >= self.config.min_decompose_tokens && self.is_multi_part(text) {
            return Strategy::Decomposed;
        }

        if tokens >= self.config.long_query_tokens {
            return Strategy::SelfRefine;
        }

        if tokens <= self.config.short_query_tokens || has_exact_match_signal(text) {
            return Strategy::Hybrid;
        }

        Strategy::VectorOnly
    }
}

/// Lowercased alphanumeric words.
fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

/// Quoted phrases, numbers, and code-like identifiers favour lexical search.
fn has_exact_match_signal(text: &str) -> bool {
    if text.matches('"').count() >= 2 {
        return true;
    }

    text.split_whitespace().any(|token| {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '_');
        let has_digit = token.chars().any(|c| c.is_ascii_digit());
        let snake = token.contains('_') || token.contains("::");
        let camel = token
            .chars()
            .skip(1)
            .any(|c| c.is_uppercase())
            && token.chars().any(|c| c.is_lowercase());
        has_digit || snake || camel
    })
}
