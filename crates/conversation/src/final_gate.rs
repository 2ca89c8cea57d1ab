//! Final-transcript admission: cooldown, spam protection and completeness
//! heuristics, tracked per participant.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_config::FinalGateSettings;
use tokio::time::Instant;
use tracing::debug;

use crate::text::{
    FINAL_QUESTION_STARTERS, NATURAL_PHRASES, ends_sentence, starts_with_any_phrase,
    starts_with_any_word, trimmed_len,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GateDecision {
    pub admitted: bool,
    pub reason: &'static str,
}

impl GateDecision {
    fn admit(reason: &'static str) -> Self {
        Self {
            admitted: true,
            reason,
        }
    }

    fn reject(reason: &'static str) -> Self {
        Self {
            admitted: false,
            reason,
        }
    }
}

struct FinalTrackerEntry {
    last_accepted_at: Instant,
    accepted_count: u64,
    consecutive_short_count: u32,
}

pub struct FinalTranscriptGate {
    settings: FinalGateSettings,
    participants: DashMap<String, FinalTrackerEntry>,
}

impl FinalTranscriptGate {
    pub fn new(settings: FinalGateSettings) -> Self {
        Self {
            settings,
            participants: DashMap::new(),
        }
    }

    pub fn should_process(&self, participant: &str, text: &str, confidence: f64) -> GateDecision {
        self.should_process_at(participant, text, confidence, Instant::now())
    }

    pub fn should_process_at(
        &self,
        participant: &str,
        text: &str,
        confidence: f64,
        now: Instant,
    ) -> GateDecision {
        let len = trimmed_len(text);
        if len == 0 {
            return GateDecision::reject("empty transcript");
        }
        let is_short = len < self.settings.min_length;

        let mut state = match self.participants.entry(participant.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert(FinalTrackerEntry {
                    last_accepted_at: now,
                    accepted_count: 1,
                    consecutive_short_count: u32::from(is_short),
                });
                return GateDecision::admit("first transcript");
            }
            Entry::Occupied(occupied) => occupied.into_ref(),
        };

        if now.saturating_duration_since(state.last_accepted_at) < self.settings.cooldown() {
            debug!(%participant, "Final transcript inside cooldown");
            return GateDecision::reject("cooldown active");
        }

        if is_short {
            state.consecutive_short_count += 1;
            if state.consecutive_short_count > self.settings.max_consecutive_short {
                debug!(%participant, count = state.consecutive_short_count, "Short transcript run rejected");
                return GateDecision::reject("spam protection");
            }
        } else {
            state.consecutive_short_count = 0;
        }

        // Short transcripts that survive the spam guard still need to look complete.
        let decision = self.classify(text, len, confidence);

        if decision.admitted {
            state.last_accepted_at = state.last_accepted_at.max(now);
            state.accepted_count += 1;
        }
        decision
    }

    fn classify(&self, text: &str, len: usize, confidence: f64) -> GateDecision {
        let s = &self.settings;
        if ends_sentence(text) {
            GateDecision::admit("sentence ending")
        } else if starts_with_any_word(text, FINAL_QUESTION_STARTERS) && len >= s.question_min_length
        {
            GateDecision::admit("question pattern")
        } else if confidence >= s.trigger_threshold && len >= s.confidence_min_length {
            GateDecision::admit("high confidence")
        } else if starts_with_any_phrase(text, NATURAL_PHRASES) && len >= s.natural_phrase_min_length
        {
            GateDecision::admit("natural phrase")
        } else if len >= s.substantial_length {
            GateDecision::admit("substantial content")
        } else {
            GateDecision::reject("fragmented or incomplete")
        }
    }

    /// Forgets a participant so their next final is treated as their first.
    pub fn reset(&self, participant: &str) {
        self.participants.remove(participant);
    }

    pub fn last_accepted_at(&self, participant: &str) -> Option<Instant> {
        self.participants
            .get(participant)
            .map(|state| state.last_accepted_at)
    }

    pub fn accepted_count(&self, participant: &str) -> u64 {
        self.participants
            .get(participant)
            .map_or(0, |state| state.accepted_count)
    }

    /// Drops participants with no accepted final inside the inactivity window.
    pub fn sweep_inactive(&self, now: Instant) -> usize {
        let inactivity = self.settings.inactivity();
        let before = self.participants.len();
        self.participants
            .retain(|_, state| now.saturating_duration_since(state.last_accepted_at) < inactivity);
        before - self.participants.len()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }
}
