//! Tokenization shared by the reference indexes.

use std::collections::HashSet;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "do", "does", "for", "from", "how",
    "i", "in", "is", "it", "its", "me", "of", "on", "or", "tell", "that", "the", "this", "to",
    "was", "what", "when", "where", "which", "who", "why", "with",
];

/// Lowercased alphanumeric words, keeping `_` inside identifiers.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .collect()
}

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(&word)
}

/// Tokens with stopwords removed, in order.
pub fn content_terms(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|w| !is_stopword(w))
        .collect()
}

/// Distinct content terms.
pub fn term_set(text: &str) -> HashSet<String> {
    content_terms(text).into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        assert_eq!(
            tokenize("What's max_connections, in HTTP/2?"),
            vec!["what", "s", "max_connections", "in", "http", "2"]
        );
    }

    #[test]
    fn test_content_terms_drop_stopwords() {
        assert_eq!(
            content_terms("What is the capital of France?"),
            vec!["capital", "france"]
        );
    }
}
