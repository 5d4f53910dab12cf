//! Extractive answer generation.

use async_trait::async_trait;

use rag_core::{Generator, RagError, Result};

use crate::text::{content_terms, term_set};

/// Builds an answer from the context sentences that share the most terms
/// with the query, kept in context order.
#[derive(Debug, Clone)]
pub struct ExtractiveGenerator {
    pub max_sentences: usize,
}

impl Default for ExtractiveGenerator {
    fn default() -> Self {
        Self { max_sentences: 3 }
    }
}

#[async_trait]
impl Generator for ExtractiveGenerator {
    async fn generate(&self, context: &[&str], query_text: &str) -> Result<String> {
        if context.is_empty() {
            return Err(RagError::generation("no context to answer from"));
        }

        let query_terms = term_set(query_text);
        let sentences: Vec<&str> = context.iter().flat_map(|c| split_sentences(*c)).collect();

        let mut scored: Vec<(usize, usize)> = sentences
            .iter()
            .enumerate()
            .map(|(i, s)| {
                let overlap = content_terms(s)
                    .iter()
                    .filter(|t| query_terms.contains(*t))
                    .count();
                (i, overlap)
            })
            .filter(|(_, overlap)| *overlap > 0)
            .collect();

        if scored.is_empty() {
            return Err(RagError::generation("context does not mention the query terms"));
        }

        // Stable: earlier context wins among equal overlap.
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored.truncate(self.max_sentences.max(1));
        scored.sort_by_key(|(i, _)| *i);

        Ok(scored
            .iter()
            .map(|(i, _)| sentences[*i])
            .collect::<Vec<_>>()
            .join(" "))
    }
}

fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if matches!(c, '.' | '!' | '?' | '\n') {
            let end = i + c.len_utf8();
            let sentence = text[start..end].trim();
            if sentence.len() > 1 {
                sentences.push(sentence);
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail);
    }
    sentences
}
