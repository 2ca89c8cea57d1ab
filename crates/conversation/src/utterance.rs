//! Partial-transcript admission: decides the earliest safe moment to start
//! answering an utterance that is still being spoken.

use std::collections::VecDeque;
use std::fmt;

use dashmap::DashMap;
use parley_config::UtteranceSettings;
use tokio::time::Instant;
use tracing::debug;

use crate::SessionKey;
use crate::text::{
    CONVERSATIONAL_STARTERS, QUESTION_STARTERS, ends_sentence, starts_with_any_phrase,
    starts_with_any_word, trimmed_len,
};

/// The rule that admitted a partial transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    SentenceEnding,
    EarlyQuestion,
    NaturalPause,
    SmartConfidence,
    ConversationalStarter,
}

impl TriggerReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerReason::SentenceEnding => "sentence_ending",
            TriggerReason::EarlyQuestion => "early_question",
            TriggerReason::NaturalPause => "natural_pause",
            TriggerReason::SmartConfidence => "smart_confidence",
            TriggerReason::ConversationalStarter => "conversational_starter",
        }
    }
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct UtteranceState {
    started_at: Instant,
    last_partial_at: Instant,
    /// Accepted partial texts, oldest first.
    partials: Vec<String>,
    last_sequence: Option<u64>,
    processing_started: bool,
    confidences: VecDeque<f64>,
    question_detected: bool,
}

impl UtteranceState {
    fn new(now: Instant) -> Self {
        Self {
            started_at: now,
            last_partial_at: now,
            partials: Vec::new(),
            last_sequence: None,
            processing_started: false,
            confidences: VecDeque::new(),
            question_detected: false,
        }
    }
}

/// Per-utterance partial transcript state, keyed by `participant:utterance`.
pub struct UtteranceTracker {
    settings: UtteranceSettings,
    utterances: DashMap<SessionKey, UtteranceState>,
}

impl UtteranceTracker {
    pub fn new(settings: UtteranceSettings) -> Self {
        Self {
            settings,
            utterances: DashMap::new(),
        }
    }

    /// Records a partial transcript.
    ///
    /// Returns `true` only when the partial grew by more than the configured
    /// delta over the previously accepted one; anything else is ignored.
    pub fn add_partial(&self, key: &SessionKey, text: &str, sequence: u64, confidence: f64) -> bool {
        self.add_partial_at(key, text, sequence, confidence, Instant::now())
    }

    pub fn add_partial_at(
        &self,
        key: &SessionKey,
        text: &str,
        sequence: u64,
        confidence: f64,
        now: Instant,
    ) -> bool {
        let mut entry = self
            .utterances
            .entry(key.clone())
            .or_insert_with(|| UtteranceState::new(now));
        let state = entry.value_mut();
        state.last_partial_at = now;

        if state.last_sequence.is_some_and(|last| sequence <= last) {
            debug!(%key, sequence, "Out-of-order partial ignored");
            return false;
        }
        state.last_sequence = Some(sequence);

        let trimmed = text.trim();
        let len = trimmed_len(trimmed);
        let significant = match state.partials.last() {
            Some(previous) => len > trimmed_len(previous) + self.settings.growth_delta_chars,
            None => len > 0,
        };
        if !significant {
            return false;
        }

        state.partials.push(trimmed.to_string());
        state.confidences.push_back(confidence.clamp(0.0, 1.0));
        while state.confidences.len() > self.settings.confidence_history {
            state.confidences.pop_front();
        }
        if starts_with_any_word(trimmed, QUESTION_STARTERS) {
            state.question_detected = true;
        }
        true
    }

    /// Whether the latest accepted partial is worth answering now.
    pub fn should_start_processing(&self, key: &SessionKey) -> bool {
        self.evaluate(key, Instant::now()).is_some()
    }

    /// Runs the admission rules in priority order against the latest partial.
    pub fn evaluate(&self, key: &SessionKey, now: Instant) -> Option<TriggerReason> {
        let state = self.utterances.get(key)?;
        if state.processing_started {
            return None;
        }
        let text = state.partials.last()?;
        let len = trimmed_len(text);
        if len < self.settings.min_length {
            return None;
        }

        if ends_sentence(text) {
            return Some(TriggerReason::SentenceEnding);
        }

        if state.question_detected
            && starts_with_any_word(text, QUESTION_STARTERS)
            && len >= self.settings.question_min_length
        {
            return Some(TriggerReason::EarlyQuestion);
        }

        let elapsed = now.saturating_duration_since(state.started_at);
        if elapsed >= self.settings.min_pause() && len >= self.settings.pause_min_length {
            return Some(TriggerReason::NaturalPause);
        }

        if len >= self.settings.confidence_min_length
            && self.boosted_confidence(&state) >= self.settings.trigger_threshold
        {
            return Some(TriggerReason::SmartConfidence);
        }

        if len >= self.settings.starter_min_length
            && elapsed >= self.settings.starter_min_elapsed()
            && starts_with_any_phrase(text, CONVERSATIONAL_STARTERS)
        {
            return Some(TriggerReason::ConversationalStarter);
        }

        None
    }

    /// Latest confidence boosted by question context, a rising trend and
    /// stability, capped at 1.0.
    fn boosted_confidence(&self, state: &UtteranceState) -> f64 {
        let Some(&latest) = state.confidences.back() else {
            return 0.0;
        };
        let mut score = latest;
        if state.question_detected {
            score += self.settings.question_boost;
        }

        let samples: Vec<f64> = state.confidences.iter().copied().collect();
        if let [.., a, b, c] = samples.as_slice()
            && a < b
            && b < c
        {
            score += self.settings.trend_boost;
        }
        if samples.len() >= 4 {
            let last_four = &samples[samples.len() - 4..];
            let mean = last_four.iter().sum::<f64>() / 4.0;
            let variance = last_four.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / 4.0;
            if variance < self.settings.stability_max_variance {
                score += self.settings.stability_boost;
            }
        }
        score.min(1.0)
    }

    /// Flags the utterance as answered. Returns `true` on the first call only.
    pub fn mark_processing_started(&self, key: &SessionKey) -> bool {
        match self.utterances.get_mut(key) {
            Some(mut state) if !state.processing_started => {
                state.processing_started = true;
                true
            }
            _ => false,
        }
    }

    pub fn is_processing_started(&self, key: &SessionKey) -> bool {
        self.utterances
            .get(key)
            .is_some_and(|state| state.processing_started)
    }

    pub fn latest_text(&self, key: &SessionKey) -> Option<String> {
        self.utterances
            .get(key)
            .and_then(|state| state.partials.last().cloned())
    }

    pub fn question_detected(&self, key: &SessionKey) -> bool {
        self.utterances
            .get(key)
            .is_some_and(|state| state.question_detected)
    }

    pub fn remove(&self, key: &SessionKey) {
        self.utterances.remove(key);
    }

    /// Drops utterances with no partial for longer than the expiry window.
    pub fn sweep_expired(&self, now: Instant) -> usize {
        let expiry = self.settings.expiry();
        let before = self.utterances.len();
        self.utterances
            .retain(|_, state| now.saturating_duration_since(state.last_partial_at) < expiry);
        before - self.utterances.len()
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }
}
