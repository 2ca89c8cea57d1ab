//! In-process collaborators for single-node deployments and tests.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{
    CircuitBreaker, ConversationRecord, ConversationStore, DuplicationDetector,
    MessageFingerprint, RateLimiter, Role, Turn,
};
use crate::text::normalize_text;

/// Conversation store keeping a bounded history per conversation in memory.
pub struct InMemoryConversationStore {
    /// `room:user` -> conversation.
    conversations: DashMap<String, ConversationRecord>,
    turns: DashMap<String, VecDeque<Turn>>,
    max_turns: usize,
}

impl InMemoryConversationStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            conversations: DashMap::new(),
            turns: DashMap::new(),
            max_turns: max_turns.max(1),
        }
    }

    /// Every retained turn of a conversation, oldest first.
    pub fn turns(&self, conversation_id: &str) -> Vec<Turn> {
        self.turns
            .get(conversation_id)
            .map(|turns| turns.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryConversationStore {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn get_or_create(&self, room: &str, user: &str) -> anyhow::Result<ConversationRecord> {
        let key = format!("{room}:{user}");
        let record = self
            .conversations
            .entry(key)
            .or_insert_with(|| {
                let record = ConversationRecord {
                    id: Uuid::new_v4().to_string(),
                    room: room.to_string(),
                    user: user.to_string(),
                    created_at: Utc::now(),
                };
                debug!(conversation_id = %record.id, %room, %user, "Conversation created");
                record
            })
            .clone();
        Ok(record)
    }

    async fn append_turn(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
    ) -> anyhow::Result<()> {
        let mut turns = self.turns.entry(conversation_id.to_string()).or_default();
        turns.push_back(Turn {
            role,
            text: text.to_string(),
            at: Utc::now(),
        });
        while turns.len() > self.max_turns {
            turns.pop_front();
        }
        Ok(())
    }

    async fn recent_history(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> anyhow::Result<Vec<Turn>> {
        let history = self
            .turns
            .get(conversation_id)
            .map(|turns| {
                let skip = turns.len().saturating_sub(limit);
                turns.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default();
        Ok(history)
    }
}

#[derive(Default)]
struct SeenMessages {
    /// (conversation, message id) -> event time.
    ids: HashMap<(String, String), chrono::DateTime<Utc>>,
    /// (conversation, participant, normalized text) -> event time, finals only.
    texts: HashMap<(String, String, String), chrono::DateTime<Utc>>,
}

/// Suppresses messages replayed within a window of event time.
///
/// A message is a duplicate if its id was seen in the same conversation, or if
/// it is a final whose normalized text matches a recent final from the same
/// participant. Partials are matched by id only, since consecutive partials and
/// the closing final routinely carry identical text.
pub struct WindowDuplicationDetector {
    window: TimeDelta,
    seen: Mutex<SeenMessages>,
}

impl WindowDuplicationDetector {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: TimeDelta::from_std(window).unwrap_or(TimeDelta::seconds(2)),
            seen: Mutex::new(SeenMessages::default()),
        }
    }

    fn text_key(message: &MessageFingerprint) -> Option<(String, String, String)> {
        if message.is_partial {
            return None;
        }
        let normalized = normalize_text(&message.text);
        if normalized.is_empty() {
            return None;
        }
        Some((
            message.conversation_id.clone(),
            message.participant_id.clone(),
            normalized,
        ))
    }

    fn id_key(message: &MessageFingerprint) -> (String, String) {
        (message.conversation_id.clone(), message.message_id.clone())
    }

    fn purge(&self, seen: &mut SeenMessages, message: &MessageFingerprint) {
        let horizon = message.timestamp - self.window;
        seen.ids.retain(|_, at| *at >= horizon);
        seen.texts.retain(|_, at| *at >= horizon);
    }

    fn within_window(&self, seen_at: chrono::DateTime<Utc>, message: &MessageFingerprint) -> bool {
        (message.timestamp - seen_at).abs() <= self.window
    }

    fn lookup(&self, seen: &SeenMessages, message: &MessageFingerprint) -> bool {
        let by_id = seen
            .ids
            .get(&Self::id_key(message))
            .is_some_and(|at| self.within_window(*at, message));
        let by_text = Self::text_key(message)
            .and_then(|key| seen.texts.get(&key).copied())
            .is_some_and(|at| self.within_window(at, message));
        by_id || by_text
    }

    fn record(seen: &mut SeenMessages, message: &MessageFingerprint) {
        seen.ids.insert(Self::id_key(message), message.timestamp);
        if let Some(key) = Self::text_key(message) {
            seen.texts.insert(key, message.timestamp);
        }
    }
}

impl Default for WindowDuplicationDetector {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(2))
    }
}

#[async_trait]
impl DuplicationDetector for WindowDuplicationDetector {
    async fn is_duplicate(&self, message: &MessageFingerprint) -> bool {
        let mut seen = self.seen.lock();
        self.purge(&mut seen, message);
        self.lookup(&seen, message)
    }

    async fn mark_processed(&self, message: &MessageFingerprint) {
        Self::record(&mut self.seen.lock(), message);
    }

    async fn check_and_mark(&self, message: &MessageFingerprint) -> bool {
        let mut seen = self.seen.lock();
        self.purge(&mut seen, message);
        if self.lookup(&seen, message) {
            return true;
        }
        Self::record(&mut seen, message);
        false
    }
}

/// Rate limiter and circuit breaker that admit everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

#[async_trait]
impl RateLimiter for AllowAll {
    async fn check_request_rate(&self, _participant: &str) -> bool {
        true
    }

    async fn check_ai_rate(&self, _participant: &str) -> bool {
        true
    }
}

#[async_trait]
impl CircuitBreaker for AllowAll {
    async fn should_allow_call(&self) -> (bool, String) {
        (true, String::new())
    }
}
