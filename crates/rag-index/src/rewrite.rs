//! Rule-based query rewriting and decomposition.

use async_trait::async_trait;

use rag_core::{QueryRewriter, Result};

use crate::text::content_terms;

/// Phrases that join independent sub-questions.
const SPLITTERS: &[&str] = &[" and ", " versus ", " vs ", " as well as ", " also "];

/// Rewrites queries without a model.
///
/// `rewrite` yields the keyword form of the query followed by overlapping
/// term pairs. `decompose` splits on question marks, semicolons, and joining
/// phrases.
#[derive(Debug, Clone, Default)]
pub struct RuleRewriter;

impl RuleRewriter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QueryRewriter for RuleRewriter {
    async fn rewrite(&self, query_text: &str, n: usize) -> Result<Vec<String>> {
        let terms = content_terms(query_text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut rewrites = vec![terms.join(" ")];
        if terms.len() > 2 {
            rewrites.extend(terms.windows(2).map(|pair| pair.join(" ")));
        }
        rewrites.truncate(n);
        Ok(rewrites)
    }

    async fn decompose(&self, query_text: &str) -> Result<Vec<String>> {
        let mut parts: Vec<String> = vec![query_text.to_string()];

        for separator in ['?', ';'] {
            parts = parts
                .iter()
                .flat_map(|p| p.split(separator).map(str::to_string).collect::<Vec<_>>())
                .collect();
        }

        for splitter in SPLITTERS {
            parts = parts
                .iter()
                .flat_map(|p| split_phrase(p, splitter))
                .collect();
        }

        Ok(parts
            .into_iter()
            .map(|p| p.trim().trim_end_matches(['.', ',']).trim().to_string())
            .filter(|p| !content_terms(p).is_empty())
            .collect())
    }
}

/// Case-insensitive split on `phrase`. A split is only taken when both sides
/// carry at least two words, so "salt and pepper" stays whole.
fn split_phrase(text: &str, phrase: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    if lower.len() != text.len() {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut start = 0;
    let mut search_from = 0;
    while let Some(offset) = lower[search_from..].find(phrase) {
        let at = search_from + offset;
        let left = &text[start..at];
        let right = &text[at + phrase.len()..];
        if left.split_whitespace().count() >= 2 && right.split_whitespace().count() >= 2 {
            parts.push(left.to_string());
            start = at + phrase.len();
        }
        search_from = at + phrase.len();
    }
    parts.push(text[start..].to_string());
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rewrite_keyword_form_and_pairs() {
        let rewriter = RuleRewriter::new();
        let rewrites = rewriter
            .rewrite("How does the rust borrow checker work?", 3)
            .await
            .unwrap();
        assert_eq!(rewrites, vec!["rust borrow checker work", "rust borrow", "borrow checker"]);

        let one = rewriter.rewrite("capital of France", 1).await.unwrap();
        assert_eq!(one, vec!["capital france"]);
        assert!(rewriter.rewrite("what is it", 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decompose_on_connectives() {
        let parts = RuleRewriter::new()
            .decompose("What is the population of France and what is its capital?")
            .await
            .unwrap();
        assert_eq!(parts, vec!["What is the population of France", "what is its capital"]);
    }

    #[tokio::test]
    async fn test_decompose_on_questions() {
        let parts = RuleRewriter::new()
            .decompose("Who founded Rome? When did it fall?")
            .await
            .unwrap();
        assert_eq!(parts, vec!["Who founded Rome", "When did it fall"]);
    }

    #[tokio::test]
    async fn test_short_conjunction_stays_whole() {
        let parts = RuleRewriter::new()
            .decompose("recipes with salt and pepper")
            .await
            .unwrap();
        assert_eq!(parts, vec!["recipes with salt and pepper"]);
    }
}
