//! Concurrency-limited, interruptible admission of phrases into speech synthesis.
//!
//! Every phrase is dispatched as its own task in the owning session's
//! [`TaskGroup`]. Urgent phrases compete for the synthesis limiter at once;
//! continuation and final phrases sleep for the inter-phrase gap first. The
//! per-session pending list is only ever mutated under its DashMap entry lock,
//! never across an await.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parley_config::TtsQueueSettings;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::clients::{PublishRequest, TtsClient};
use crate::error::{ConversationError, ConversationResult};
use crate::task_group::TaskGroup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// First phrase of a response; bypasses the inter-phrase gap.
    Urgent = 1,
    Continuation = 2,
    Final = 3,
}

#[derive(Debug, Clone, Serialize)]
pub struct TtsPhrase {
    pub id: u64,
    pub text: String,
    pub room: String,
    pub session_id: String,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub language: String,
    pub voice_ref: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct InterruptResult {
    pub interrupted: bool,
    pub cleared_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct SessionQueueStats {
    /// Phrases waiting for the gap or the limiter.
    pub queued_phrases: usize,
    /// Phrases currently inside a synthesis call.
    pub in_flight_phrases: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct GlobalQueueStats {
    pub total_queued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    /// Phrases cleared by an interruption before synthesis.
    pub total_dropped: u64,
    pub interrupted_sessions: u64,
    /// Sessions with at least one pending phrase.
    pub active_sessions: usize,
    pub in_flight: usize,
    pub capacity: usize,
}

struct PendingPhrase {
    id: u64,
    in_flight: bool,
}

#[derive(Default)]
struct SessionPhrases {
    pending: Vec<PendingPhrase>,
}

#[derive(Default)]
struct QueueCounters {
    total_queued: AtomicU64,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    total_dropped: AtomicU64,
    interrupted_sessions: AtomicU64,
    in_flight: AtomicUsize,
}

pub struct TtsAdmissionQueue {
    tts: Arc<dyn TtsClient>,
    settings: TtsQueueSettings,
    limiter: Semaphore,
    /// Pending phrases, keyed by session id. Entries are removed once empty.
    sessions: DashMap<String, SessionPhrases>,
    /// Phrase tasks, keyed by session id.
    groups: DashMap<String, Arc<TaskGroup>>,
    next_phrase_id: AtomicU64,
    counters: QueueCounters,
    closed: AtomicBool,
}

/// Removes a phrase from its session's pending list when the phrase task ends,
/// however it ends.
struct PendingGuard<'a> {
    queue: &'a TtsAdmissionQueue,
    session_id: &'a str,
    phrase_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.queue.remove_pending(self.session_id, self.phrase_id);
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl TtsAdmissionQueue {
    pub fn new(tts: Arc<dyn TtsClient>, settings: TtsQueueSettings) -> Arc<Self> {
        let capacity = settings.max_concurrent.max(1);
        info!(
            backend = %tts.name(),
            capacity,
            gap_ms = settings.inter_phrase_gap_ms,
            "TTS admission queue created"
        );
        Arc::new(Self {
            tts,
            limiter: Semaphore::new(capacity),
            settings,
            sessions: DashMap::new(),
            groups: DashMap::new(),
            next_phrase_id: AtomicU64::new(1),
            counters: QueueCounters::default(),
            closed: AtomicBool::new(false),
        })
    }

    /// Admits a phrase for synthesis.
    ///
    /// Returns `false` for empty or whitespace-only text, and after [`close`](Self::close).
    pub fn queue_phrase(
        self: &Arc<Self>,
        text: &str,
        room: &str,
        session_id: &str,
        priority: Priority,
        language: Option<&str>,
        voice_ref: Option<&str>,
    ) -> bool {
        let text = text.trim();
        if text.is_empty() {
            debug!(%session_id, "Rejected empty phrase");
            return false;
        }
        if self.closed.load(Ordering::SeqCst) {
            warn!(%session_id, "Rejected phrase, queue closed");
            return false;
        }

        let phrase = TtsPhrase {
            id: self.next_phrase_id.fetch_add(1, Ordering::SeqCst),
            text: text.to_string(),
            room: room.to_string(),
            session_id: session_id.to_string(),
            priority,
            created_at: Utc::now(),
            language: language
                .unwrap_or(self.settings.default_language.as_str())
                .to_string(),
            voice_ref: voice_ref
                .map(str::to_string)
                .or_else(|| self.settings.default_voice.clone()),
        };

        self.sessions
            .entry(phrase.session_id.clone())
            .or_default()
            .pending
            .push(PendingPhrase {
                id: phrase.id,
                in_flight: false,
            });
        self.counters.total_queued.fetch_add(1, Ordering::SeqCst);
        debug!(
            %session_id,
            phrase_id = phrase.id,
            priority = ?phrase.priority,
            chars = phrase.text.len(),
            "Phrase queued"
        );

        let group = self
            .groups
            .entry(phrase.session_id.clone())
            .or_default()
            .clone();
        let queue = Arc::clone(self);
        group.spawn(async move { queue.process_phrase(phrase).await });
        true
    }

    async fn process_phrase(&self, phrase: TtsPhrase) -> ConversationResult<()> {
        let _pending = PendingGuard {
            queue: self,
            session_id: &phrase.session_id,
            phrase_id: phrase.id,
        };

        if phrase.priority != Priority::Urgent {
            tokio::time::sleep(self.settings.inter_phrase_gap()).await;
        }

        let permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ConversationError::ShuttingDown)?;

        if !self.begin_synthesis(&phrase.session_id, phrase.id) {
            self.counters.total_dropped.fetch_add(1, Ordering::SeqCst);
            debug!(session_id = %phrase.session_id, phrase_id = phrase.id, "Phrase cleared before synthesis");
            return Ok(());
        }

        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = InFlightGuard(&self.counters.in_flight);
        let result = self
            .tts
            .publish(PublishRequest {
                room: phrase.room.clone(),
                text: phrase.text.clone(),
                language: phrase.language.clone(),
                voice_ref: phrase.voice_ref.clone(),
                streaming: self.settings.streaming_synthesis,
            })
            .await;
        drop(in_flight);
        drop(permit);

        match result {
            Ok(()) => {
                self.counters.total_processed.fetch_add(1, Ordering::SeqCst);
                debug!(session_id = %phrase.session_id, phrase_id = phrase.id, "Phrase synthesized");
                Ok(())
            }
            Err(e) => {
                self.counters.total_failed.fetch_add(1, Ordering::SeqCst);
                warn!(
                    session_id = %phrase.session_id,
                    phrase_id = phrase.id,
                    error = %e,
                    "Phrase synthesis failed"
                );
                Err(ConversationError::UpstreamSynthesis(e.to_string()))
            }
        }
    }

    /// Marks a phrase as in flight if it is still pending.
    fn begin_synthesis(&self, session_id: &str, phrase_id: u64) -> bool {
        let Some(mut session) = self.sessions.get_mut(session_id) else {
            return false;
        };
        match session.pending.iter_mut().find(|p| p.id == phrase_id) {
            Some(pending) => {
                pending.in_flight = true;
                true
            }
            None => false,
        }
    }

    fn remove_pending(&self, session_id: &str, phrase_id: u64) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.pending.retain(|p| p.id != phrase_id);
        }
        self.sessions
            .remove_if(session_id, |_, session| session.pending.is_empty());
    }

    /// Clears every phrase of a session that has not yet reached synthesis.
    ///
    /// Phrases already inside a synthesis call play out.
    pub fn interrupt_session(&self, session_id: &str) -> InterruptResult {
        let cleared_count = {
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                return InterruptResult::default();
            };
            let before = session.pending.len();
            session.pending.retain(|p| p.in_flight);
            before - session.pending.len()
        };
        self.sessions
            .remove_if(session_id, |_, session| session.pending.is_empty());
        self.counters
            .interrupted_sessions
            .fetch_add(1, Ordering::SeqCst);
        info!(%session_id, cleared_count, "Session interrupted");
        InterruptResult {
            interrupted: true,
            cleared_count,
        }
    }

    pub fn get_session_stats(&self, session_id: &str) -> SessionQueueStats {
        self.sessions
            .get(session_id)
            .map(|session| {
                let in_flight_phrases = session.pending.iter().filter(|p| p.in_flight).count();
                SessionQueueStats {
                    queued_phrases: session.pending.len() - in_flight_phrases,
                    in_flight_phrases,
                }
            })
            .unwrap_or_default()
    }

    pub fn get_global_stats(&self) -> GlobalQueueStats {
        let c = &self.counters;
        GlobalQueueStats {
            total_queued: c.total_queued.load(Ordering::SeqCst),
            total_processed: c.total_processed.load(Ordering::SeqCst),
            total_failed: c.total_failed.load(Ordering::SeqCst),
            total_dropped: c.total_dropped.load(Ordering::SeqCst),
            interrupted_sessions: c.interrupted_sessions.load(Ordering::SeqCst),
            active_sessions: self.sessions.len(),
            in_flight: c.in_flight.load(Ordering::SeqCst),
            capacity: self.settings.max_concurrent.max(1),
        }
    }

    /// Waits for every phrase task of a session and surfaces the first failure.
    pub async fn join_session(&self, session_id: &str) -> ConversationResult<()> {
        let group = self.groups.remove(session_id).map(|(_, group)| group);
        match group {
            Some(group) => group.join_all().await,
            None => Ok(()),
        }
    }

    /// Stops supervising a session's phrase tasks; they still run to completion.
    pub fn detach_session(&self, session_id: &str) {
        if self.groups.remove(session_id).is_some() {
            debug!(%session_id, "Phrase tasks detached");
        }
    }

    /// Clears pending phrases and aborts every phrase task of a session,
    /// including ones mid-synthesis.
    pub fn abort_session(&self, session_id: &str) {
        self.interrupt_session(session_id);
        if let Some((_, group)) = self.groups.remove(session_id) {
            group.abort_all();
        }
    }

    /// Aborts phrase tasks of every session.
    pub fn abort_all(&self) {
        let session_ids: Vec<String> = self.groups.iter().map(|e| e.key().clone()).collect();
        for session_id in session_ids {
            self.abort_session(&session_id);
        }
    }

    /// Stops admitting new phrases. Already queued phrases still play.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("TTS admission queue closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
