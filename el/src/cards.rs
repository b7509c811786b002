//! Context cards - lightweight summaries of logged messages
//!
//! The context selector scores cards instead of full messages; winners are
//! hydrated back from the sink by (session_id, content_hash).

use serde::{Deserialize, Serialize};

/// Words too common to carry selection signal
const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "if", "in", "into", "is",
    "it", "its", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there", "these", "they",
    "this", "to", "was", "were", "will", "with", "you", "your",
];

/// Summary record for one logged message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCard {
    pub session_id: String,
    /// Joins to the full EventRecord
    pub content_hash: String,
    pub summary: String,
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub estimated_tokens: usize,
    #[serde(default)]
    pub is_anchor: bool,
    #[serde(default)]
    pub is_callout: bool,
}

impl ContextCard {
    /// Build a card from raw message text
    pub fn from_text(session_id: impl Into<String>, content_hash: impl Into<String>, text: &str) -> Self {
        Self {
            session_id: session_id.into(),
            content_hash: content_hash.into(),
            summary: summarize(text, 200),
            keywords: extract_keywords(text, 12),
            embedding: None,
            estimated_tokens: estimate_tokens(text),
            is_anchor: false,
            is_callout: false,
        }
    }

    pub fn with_anchor(mut self, anchor: bool) -> Self {
        self.is_anchor = anchor;
        self
    }

    pub fn with_callout(mut self, callout: bool) -> Self {
        self.is_callout = callout;
        self
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }
}

/// First line(s) of the text, clipped to `max_chars` on a char boundary
pub fn summarize(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let clipped: String = flat.chars().take(max_chars).collect();
    format!("{}…", clipped.trim_end())
}

/// Frequency-ranked keywords, lowercased, stopwords removed
pub fn extract_keywords(text: &str, max_keywords: usize) -> Vec<String> {
    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for word in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        let lower = word.to_lowercase();
        if lower.len() < 3 || STOPWORDS.contains(&lower.as_str()) {
            continue;
        }
        *counts.entry(lower).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    // Ties break alphabetically so extraction is deterministic
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(max_keywords).map(|(w, _)| w).collect()
}

/// Rough token estimate (4 chars per token)
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_text_populates_fields() {
        let card = ContextCard::from_text("s1", "abcd1234abcd1234", "The parser rejects malformed headers quickly");
        assert_eq!(card.session_id, "s1");
        assert!(card.keywords.contains(&"parser".to_string()));
        assert!(card.estimated_tokens > 0);
        assert!(!card.is_anchor);
    }

    #[test]
    fn test_summarize_clips_long_text() {
        let long = "word ".repeat(100);
        let summary = summarize(&long, 50);
        assert!(summary.chars().count() <= 51);
        assert!(summary.ends_with('…'));
    }

    #[test]
    fn test_keywords_skip_stopwords() {
        let words = extract_keywords("the quick brown fox and the lazy dog", 10);
        assert!(!words.contains(&"the".to_string()));
        assert!(!words.contains(&"and".to_string()));
        assert!(words.contains(&"quick".to_string()));
    }

    #[test]
    fn test_keywords_deterministic_order() {
        let a = extract_keywords("alpha beta gamma alpha", 10);
        let b = extract_keywords("alpha beta gamma alpha", 10);
        assert_eq!(a, b);
        assert_eq!(a[0], "alpha");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
