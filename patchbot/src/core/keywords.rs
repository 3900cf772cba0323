//! Keyword extraction from free-text change requests.

use std::collections::BTreeSet;

/// Common English words that carry no signal for code search.
const STOP_WORDS: &[&str] = &[
    "about", "after", "all", "also", "and", "any", "are", "because", "been", "before", "being",
    "but", "can", "could", "did", "does", "done", "each", "for", "from", "had", "has", "have",
    "her", "here", "him", "his", "how", "into", "its", "just", "like", "more", "most", "not",
    "now", "only", "other", "our", "out", "over", "please", "should", "some", "such", "than",
    "that", "the", "their", "them", "then", "there", "these", "they", "this", "those", "under",
    "use", "very", "was", "were", "what", "when", "where", "which", "while", "who", "why",
    "will", "with", "would", "you", "your",
];

/// Extract significant search tokens from a change request.
///
/// Lower-cases the input, treats every non-word character as a separator,
/// and drops stop-words and tokens shorter than three characters. The result
/// is a set: duplicated input tokens never produce duplicated output.
pub fn extract_keywords(text: &str) -> BTreeSet<String> {
    let lowered = text.to_lowercase();
    let mut keywords = BTreeSet::new();
    for token in lowered.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
        if token.chars().count() <= 2 || STOP_WORDS.contains(&token) {
            continue;
        }
        keywords.insert(token.to_string());
    }
    keywords
}
