//! Deterministic tokenizer shared by `BM25Index` and `QueryExpander`.

use std::collections::HashSet;

use once_cell::sync::Lazy;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "the", "and", "or", "but", "if", "then", "else", "of", "to", "in", "on", "at",
        "by", "for", "with", "about", "against", "between", "into", "through", "during", "before",
        "after", "above", "below", "from", "up", "down", "is", "are", "was", "were", "be", "been",
        "being", "have", "has", "had", "having", "do", "does", "did", "doing", "this", "that",
        "these", "those", "it", "its", "i", "you", "he", "she", "we", "they", "them", "their",
        "what", "which", "who", "whom", "as", "not", "no", "so", "too", "very", "can", "will",
        "just", "should", "now",
    ]
    .into_iter()
    .collect()
});

/// Split, lowercase, and filter `text` into the term sequence used by BM25
/// and the HyDE-style query expander.
///
/// Steps: split on any char that is not a letter or digit, lowercase with
/// Unicode case folding, drop tokens shorter than 2 chars, drop stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() >= 2)
        .filter(|s| !STOP_WORDS.contains(s.as_str()))
        .collect()
}
