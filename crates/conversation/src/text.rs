//! Small text helpers shared by the admission heuristics.

/// Interrogatives and modals that open a question early in an utterance.
pub const QUESTION_STARTERS: &[&str] = &[
    "what", "how", "why", "when", "where", "who", "which", "can", "could", "would", "should",
    "will", "is", "are", "do", "does",
];

/// Wider interrogative/auxiliary set used once the utterance is final.
pub const FINAL_QUESTION_STARTERS: &[&str] = &[
    "what", "how", "why", "when", "where", "who", "whom", "whose", "which", "can", "could",
    "would", "should", "will", "shall", "may", "might", "must", "is", "are", "am", "was", "were",
    "do", "does", "did", "have", "has", "had", "isn't", "aren't", "don't", "doesn't", "didn't",
    "can't", "won't",
];

/// Discourse openers that usually start a complete thought.
pub const CONVERSATIONAL_STARTERS: &[&str] = &[
    "so", "well", "okay", "ok", "alright", "actually", "basically", "hey", "please",
    "i think", "i want", "i need", "i was", "let's", "let me", "you know", "tell me",
];

/// Phrases that mark a natural request on the final path.
pub const NATURAL_PHRASES: &[&str] = &[
    "i think", "i want", "i need", "i would like", "i'd like", "can you", "could you",
    "would you", "will you", "please", "tell me", "show me", "help me", "let me", "let's",
    "do you", "what about", "how about",
];

/// Conjunctions and discourse markers the segmenter may break a phrase on.
pub const BREAK_WORDS: &[&str] = &[
    "but", "and", "or", "so", "then", "however", "because", "while",
];

/// Lowercase, strip punctuation, collapse whitespace.
pub fn normalize_text(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '\'')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Whether the trimmed text ends a sentence.
pub fn ends_sentence(text: &str) -> bool {
    text.trim_end().ends_with(['.', '!', '?'])
}

/// First word of the text, normalized.
pub fn first_word(text: &str) -> Option<String> {
    normalize_text(text)
        .split_whitespace()
        .next()
        .map(|w| w.to_string())
}

pub fn starts_with_any_word(text: &str, words: &[&str]) -> bool {
    first_word(text).is_some_and(|first| words.contains(&first.as_str()))
}

/// Prefix match on whole words, so "so" does not match "sometimes".
pub fn starts_with_any_phrase(text: &str, phrases: &[&str]) -> bool {
    let normalized = normalize_text(text);
    phrases.iter().any(|phrase| {
        normalized == *phrase
            || normalized
                .strip_prefix(phrase)
                .is_some_and(|rest| rest.starts_with(' '))
    })
}

/// Character length of the trimmed text.
pub fn trimmed_len(text: &str) -> usize {
    text.trim().chars().count()
}
