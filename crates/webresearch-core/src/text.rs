use std::collections::BTreeSet;

const STOPWORDS: &[&str] = &[
    "about", "after", "also", "and", "are", "because", "been", "before", "being", "between",
    "both", "but", "can", "could", "did", "does", "doing", "for", "from", "had", "has", "have",
    "how", "into", "its", "more", "most", "not", "now", "off", "once", "only", "other", "our",
    "out", "over", "own", "same", "should", "some", "such", "than", "that", "the", "their",
    "them", "then", "there", "these", "they", "this", "those", "through", "too", "under",
    "until", "very", "was", "were", "what", "when", "where", "which", "while", "who", "whom",
    "why", "will", "with", "would", "you", "your",
];

/// Lowercased alphanumeric terms of at least three characters, minus stopwords.
pub(crate) fn content_terms(text: &str) -> BTreeSet<String> {
    text.split(|ch: char| !ch.is_alphanumeric())
        .filter(|word| word.chars().count() >= 3)
        .map(str::to_lowercase)
        .filter(|word| !STOPWORDS.contains(&word.as_str()))
        .collect()
}

pub(crate) fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Truncate to at most `max_chars` characters, never splitting a char.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Split prose into sentences at `.`, `!` or `?` followed by whitespace.
pub(crate) fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        current.push(ch);
        let boundary = matches!(ch, '.' | '!' | '?')
            && chars.peek().is_none_or(|next| next.is_whitespace());
        if boundary {
            let sentence = collapse_whitespace(&current);
            if !sentence.is_empty() {
                out.push(sentence);
            }
            current.clear();
        }
    }
    let tail = collapse_whitespace(&current);
    if !tail.is_empty() {
        out.push(tail);
    }
    out
}

/// Normalised form used for duplicate detection: lowercase alphanumerics only.
pub(crate) fn normalized_key(text: &str) -> String {
    text.chars()
        .filter(|ch| ch.is_alphanumeric() || ch.is_whitespace())
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
