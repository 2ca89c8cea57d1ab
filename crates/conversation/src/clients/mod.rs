//! Collaborator interfaces the coordinator consumes.
//!
//! Network clients for the language model and speech synthesis, policy gates
//! and the conversation store all live outside this crate; only their traits
//! are defined here. [`memory`] holds single-node implementations.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Incremental tokens from a language model reply.
pub type TokenStream = BoxStream<'static, anyhow::Result<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One exchange in a conversation's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Request to stream a reply for a user utterance.
pub struct GenerateRequest {
    pub session_id: String,
    /// User text at the moment generation started.
    pub text: String,
    /// Recent history, oldest first.
    pub history: Vec<Turn>,
    /// Latest user text; refreshed while the utterance is still growing.
    pub context: watch::Receiver<String>,
}

/// Streaming language model.
#[async_trait]
pub trait StreamingLlmClient: Send + Sync + 'static {
    async fn generate(&self, request: GenerateRequest) -> anyhow::Result<TokenStream>;

    /// Human-readable client name.
    fn name(&self) -> &str;
}

/// Request to synthesize and play one phrase into a room.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub room: String,
    pub text: String,
    /// ISO 639-1 language code.
    pub language: String,
    pub voice_ref: Option<String>,
    pub streaming: bool,
}

/// Speech synthesis and playback.
#[async_trait]
pub trait TtsClient: Send + Sync + 'static {
    async fn publish(&self, request: PublishRequest) -> anyhow::Result<()>;

    fn name(&self) -> &str;
}

#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Whether the participant may submit another transcript.
    async fn check_request_rate(&self, participant: &str) -> bool;

    /// Whether the participant may trigger another model call.
    async fn check_ai_rate(&self, participant: &str) -> bool;
}

/// Gate that disables model calls after sustained upstream failure.
#[async_trait]
pub trait CircuitBreaker: Send + Sync + 'static {
    /// Returns whether a call may proceed and, if not, a human-readable reason.
    async fn should_allow_call(&self) -> (bool, String);

    async fn record_success(&self) {}

    async fn record_failure(&self) {}
}

/// Identity of an inbound message for replay suppression.
#[derive(Debug, Clone)]
pub struct MessageFingerprint {
    pub conversation_id: String,
    pub message_id: String,
    pub participant_id: String,
    pub text: String,
    pub is_partial: bool,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait DuplicationDetector: Send + Sync + 'static {
    async fn is_duplicate(&self, message: &MessageFingerprint) -> bool;

    async fn mark_processed(&self, message: &MessageFingerprint);

    /// Checks and marks in one step. Returns `true` if the message is a duplicate.
    ///
    /// Implementations that can do this atomically should override it.
    async fn check_and_mark(&self, message: &MessageFingerprint) -> bool {
        if self.is_duplicate(message).await {
            return true;
        }
        self.mark_processed(message).await;
        false
    }
}

/// A conversation between one user and the assistant in one room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: String,
    pub room: String,
    pub user: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ConversationStore: Send + Sync + 'static {
    async fn get_or_create(&self, room: &str, user: &str) -> anyhow::Result<ConversationRecord>;

    async fn append_turn(&self, conversation_id: &str, role: Role, text: &str)
    -> anyhow::Result<()>;

    /// Up to `limit` most recent turns, oldest first.
    async fn recent_history(&self, conversation_id: &str, limit: usize)
    -> anyhow::Result<Vec<Turn>>;
}

/// Reply from a skill that claimed the utterance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillResponse {
    pub skill: String,
    pub reply: String,
    /// Whether this utterance activated the skill, as opposed to continuing it.
    pub activated: bool,
}

/// Adjacent skill subsystem consulted before the language model on final transcripts.
#[async_trait]
pub trait SkillRouter: Send + Sync + 'static {
    async fn route(
        &self,
        conversation: &ConversationRecord,
        participant: &str,
        text: &str,
    ) -> anyhow::Result<Option<SkillResponse>>;
}
