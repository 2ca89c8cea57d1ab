//! Incremental token-to-phrase segmentation for speech synthesis.
//!
//! Rules are evaluated in priority order on every token:
//! first-phrase urgency, sentence punctuation, semantic break words,
//! minimum word count, inter-token gap, maximum buffer length.
//! Counts are whole words; only the maximum-length rule may cut mid-word.

use parley_config::SegmenterSettings;
use tokio::time::Instant;

use crate::text::BREAK_WORDS;

const SENTENCE_END: [char; 3] = ['.', '?', '!'];
const CLAUSE_END: [char; 6] = ['.', '?', '!', ',', ';', ':'];
const CLOSERS: [char; 4] = ['"', '\'', ')', ']'];

pub struct PhraseSegmenter {
    settings: SegmenterSettings,
    buffer: String,
    first_phrase_sent: bool,
    last_token_at: Option<Instant>,
}

impl PhraseSegmenter {
    pub fn new(settings: SegmenterSettings) -> Self {
        Self {
            settings,
            buffer: String::new(),
            first_phrase_sent: false,
            last_token_at: None,
        }
    }

    /// Appends a token and returns a phrase when one is ready.
    pub fn add_token(&mut self, token: &str) -> Option<String> {
        self.add_token_at(token, Instant::now())
    }

    pub fn add_token_at(&mut self, token: &str, now: Instant) -> Option<String> {
        let gap = self
            .last_token_at
            .map(|last| now.saturating_duration_since(last));
        self.last_token_at = Some(now);

        if token.is_empty() {
            return None;
        }
        let decimal_pending = self.awaits_decimal();
        self.buffer.push_str(token);

        let words = self.complete_words();

        if !self.first_phrase_sent && words >= self.settings.first_phrase_min_words {
            return self.flush_complete();
        }

        if (token.contains(SENTENCE_END) || decimal_pending)
            && let Some(phrase) = self.flush_sentence()
        {
            return Some(phrase);
        }

        if words >= self.settings.semantic_min_words && self.has_break_word() {
            return self.flush_complete();
        }

        if words >= self.settings.min_words {
            return self.flush_complete();
        }

        if gap.is_some_and(|g| g > self.settings.gap()) && words >= self.settings.gap_min_words {
            return self.flush_complete();
        }

        if self.buffer.chars().count() > self.settings.max_chars {
            let phrase = std::mem::take(&mut self.buffer);
            return self.emit(phrase.trim());
        }

        None
    }

    /// Returns whatever is left once the token stream has ended.
    pub fn flush_remaining(&mut self) -> Option<String> {
        let phrase = std::mem::take(&mut self.buffer);
        self.emit(phrase.trim())
    }

    /// Prepares the segmenter for a brand-new utterance.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.first_phrase_sent = false;
        self.last_token_at = None;
    }

    pub fn first_phrase_sent(&self) -> bool {
        self.first_phrase_sent
    }

    /// Byte offset up to which the buffer holds only whole words.
    fn word_boundary(&self) -> usize {
        let ends_clean = self.buffer.ends_with(char::is_whitespace)
            || (self.buffer.trim_end_matches(CLOSERS).ends_with(CLAUSE_END)
                && !self.awaits_decimal());
        if ends_clean {
            return self.buffer.len();
        }
        self.buffer.rfind(char::is_whitespace).unwrap_or(0)
    }

    /// A trailing `.` right after a digit may still turn out to be a decimal point.
    fn awaits_decimal(&self) -> bool {
        self.buffer
            .strip_suffix('.')
            .is_some_and(|head| head.ends_with(|c: char| c.is_ascii_digit()))
    }

    fn complete_words(&self) -> usize {
        self.buffer[..self.word_boundary()].split_whitespace().count()
    }

    fn has_break_word(&self) -> bool {
        let lower = self.buffer.to_lowercase();
        BREAK_WORDS
            .iter()
            .any(|word| lower.contains(&format!(" {word} ")))
    }

    fn flush_complete(&mut self) -> Option<String> {
        let boundary = self.word_boundary();
        self.split_at(boundary)
    }

    /// Cuts after the last sentence terminator that is not inside a number.
    fn flush_sentence(&mut self) -> Option<String> {
        let chars: Vec<(usize, char)> = self.buffer.char_indices().collect();
        let mut cut = None;
        for (i, &(idx, c)) in chars.iter().enumerate() {
            if !SENTENCE_END.contains(&c) {
                continue;
            }
            let next = chars.get(i + 1).map(|&(_, n)| n);
            let after_digit = i > 0 && chars[i - 1].1.is_ascii_digit();
            if next.is_none() && c == '.' && after_digit {
                continue;
            }
            if next.is_none_or(|n| !n.is_alphanumeric()) {
                let mut end = idx + c.len_utf8();
                for &(_, closer) in chars.iter().skip(i + 1) {
                    if !CLOSERS.contains(&closer) {
                        break;
                    }
                    end += closer.len_utf8();
                }
                cut = Some(end);
            }
        }
        cut.and_then(|end| self.split_at(end))
    }

    fn split_at(&mut self, at: usize) -> Option<String> {
        let rest = self.buffer.split_off(at);
        let phrase = std::mem::replace(&mut self.buffer, rest.trim_start().to_string());
        self.emit(phrase.trim())
    }

    fn emit(&mut self, phrase: &str) -> Option<String> {
        if phrase.is_empty() {
            return None;
        }
        self.first_phrase_sent = true;
        Some(phrase.to_string())
    }
}
