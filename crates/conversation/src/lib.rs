pub mod clients;
pub mod coordinator;
pub mod error;
pub mod final_gate;
pub mod segmenter;
pub mod session;
pub mod task_group;
pub mod text;
pub mod tts_queue;
pub mod utterance;

pub use clients::memory::{AllowAll, InMemoryConversationStore, WindowDuplicationDetector};
pub use clients::{
    CircuitBreaker, ConversationRecord, ConversationStore, DuplicationDetector, GenerateRequest,
    MessageFingerprint, PublishRequest, RateLimiter, Role, SkillResponse, SkillRouter,
    StreamingLlmClient, TokenStream, TtsClient, Turn,
};
pub use coordinator::{
    Collaborators, ConversationCoordinator, OutcomeStatus, ProcessOutcome, SweepReport,
};
pub use error::{ConversationError, ConversationResult};
pub use final_gate::{FinalTranscriptGate, GateDecision};
pub use segmenter::PhraseSegmenter;
pub use session::{SessionOrigin, SessionState};
pub use task_group::TaskGroup;
pub use tts_queue::{
    GlobalQueueStats, InterruptResult, Priority, SessionQueueStats, TtsAdmissionQueue, TtsPhrase,
};
pub use utterance::{TriggerReason, UtteranceTracker};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A transcript emitted by the speech-to-text service for one utterance.
///
/// Partials for the same utterance share `utterance_id` and grow over time;
/// the final transcript confirms the utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEvent {
    pub room: String,
    pub participant_id: String,
    pub utterance_id: String,
    pub text: String,
    pub is_partial: bool,
    pub sequence: u64,
    /// Recognizer confidence in `[0, 1]`.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    /// Transport-assigned id used for replay suppression.
    #[serde(default)]
    pub message_id: Option<String>,
}

impl TranscriptEvent {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(&self.participant_id, &self.utterance_id)
    }

    /// Id used for duplicate suppression, derived when the transport sent none.
    pub fn dedup_id(&self) -> String {
        match &self.message_id {
            Some(id) => id.clone(),
            None => format!(
                "{}:{}:{}:{}",
                self.participant_id,
                self.utterance_id,
                self.sequence,
                if self.is_partial { "partial" } else { "final" }
            ),
        }
    }
}

/// `participant_id:utterance_id`, the identity under which at most one
/// response may be generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    participant_id: String,
    utterance_id: String,
}

impl SessionKey {
    pub fn new(participant_id: &str, utterance_id: &str) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            utterance_id: utterance_id.to_string(),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn utterance_id(&self) -> &str {
        &self.utterance_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.participant_id, self.utterance_id)
    }
}
