//! Top-level orchestration of transcript events into at most one response per
//! utterance.
//!
//! The coordinator is created once at startup and shared via `Arc`. It owns the
//! admission trackers, the TTS admission queue and the session registry.
//! Sessions are keyed by `participant:utterance`; an entry is inserted through
//! the DashMap entry API before any await, so two events for the same utterance
//! can never both start a session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parley_config::{DedupPolicy, Settings};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::memory::{AllowAll, InMemoryConversationStore, WindowDuplicationDetector};
use crate::clients::{
    CircuitBreaker, ConversationRecord, ConversationStore, DuplicationDetector,
    MessageFingerprint, RateLimiter, Role, SkillRouter, StreamingLlmClient, TtsClient, Turn,
};
use crate::error::ConversationError;
use crate::final_gate::FinalTranscriptGate;
use crate::session::{
    ResponseSession, SessionHandle, SessionOrigin, SessionOutcome, SessionProgress, SessionState,
};
use crate::tts_queue::{Priority, TtsAdmissionQueue};
use crate::utterance::UtteranceTracker;
use crate::{SessionKey, TranscriptEvent};

/// External services the coordinator talks to.
pub struct Collaborators {
    pub llm: Arc<dyn StreamingLlmClient>,
    pub tts: Arc<dyn TtsClient>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub circuit_breaker: Arc<dyn CircuitBreaker>,
    pub dedup: Arc<dyn DuplicationDetector>,
    pub store: Arc<dyn ConversationStore>,
    pub skills: Option<Arc<dyn SkillRouter>>,
}

impl Collaborators {
    /// Model and speech clients with in-memory policy and storage.
    pub fn new(llm: Arc<dyn StreamingLlmClient>, tts: Arc<dyn TtsClient>) -> Self {
        Self {
            llm,
            tts,
            rate_limiter: Arc::new(AllowAll),
            circuit_breaker: Arc::new(AllowAll),
            dedup: Arc::new(WindowDuplicationDetector::default()),
            store: Arc::new(InMemoryConversationStore::default()),
            skills: None,
        }
    }

    pub fn with_rate_limiter(mut self, rate_limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_dedup(mut self, dedup: Arc<dyn DuplicationDetector>) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_skills(mut self, skills: Arc<dyn SkillRouter>) -> Self {
        self.skills = Some(skills);
        self
    }
}

/// Status reported back for every processed transcript event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    NaturalOnlineLlmStarted,
    PartialIgnored,
    NaturalPartialQueued,
    PartialProcessed,
    FinalTranscriptFiltered,
    FinalIgnoredDueToPartial,
    DuplicateBlocked,
    SkillActivated,
    SkillProcessed,
    Success,
    StreamingSuccess,
    /// The response failed and the apology phrase was spoken instead.
    FallbackSpoken,
    /// The final-path response was cancelled before it completed.
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessOutcome {
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_token_ms: Option<u64>,
}

impl ProcessOutcome {
    fn new(status: OutcomeStatus, started: Instant) -> Self {
        Self {
            status,
            session_id: None,
            ai_response: None,
            reason: None,
            processing_time_ms: started.elapsed().as_millis() as u64,
            first_token_ms: None,
        }
    }

    fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Counts of entries purged by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub utterances: usize,
    pub participants: usize,
    pub answered: usize,
}

/// What a session needs beyond its registry entry.
struct SessionLaunch {
    key: SessionKey,
    origin: SessionOrigin,
    room: String,
    participant_id: String,
    text: String,
    streaming: bool,
}

pub struct ConversationCoordinator {
    settings: Settings,
    collaborators: Collaborators,
    utterances: UtteranceTracker,
    final_gate: FinalTranscriptGate,
    tts_queue: Arc<TtsAdmissionQueue>,
    /// Live sessions, at most one per utterance.
    sessions: DashMap<SessionKey, SessionHandle>,
    /// Utterances that already received a complete response.
    answered: DashMap<SessionKey, (SessionOrigin, Instant)>,
    tasks: TaskTracker,
    accepting: AtomicBool,
}

impl ConversationCoordinator {
    pub fn new(settings: Settings, collaborators: Collaborators) -> Arc<Self> {
        let tts_queue =
            TtsAdmissionQueue::new(collaborators.tts.clone(), settings.tts_queue.clone());
        info!(
            llm = %collaborators.llm.name(),
            tts = %collaborators.tts.name(),
            policy = ?settings.coordinator.dedup_policy,
            skills = collaborators.skills.is_some(),
            "Conversation coordinator created"
        );
        Arc::new(Self {
            utterances: UtteranceTracker::new(settings.utterance.clone()),
            final_gate: FinalTranscriptGate::new(settings.final_gate.clone()),
            tts_queue,
            sessions: DashMap::new(),
            answered: DashMap::new(),
            tasks: TaskTracker::new(),
            accepting: AtomicBool::new(true),
            settings,
            collaborators,
        })
    }

    pub fn tts_queue(&self) -> &Arc<TtsAdmissionQueue> {
        &self.tts_queue
    }

    pub fn utterances(&self) -> &UtteranceTracker {
        &self.utterances
    }

    pub fn final_gate(&self) -> &FinalTranscriptGate {
        &self.final_gate
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// State of the live session for an utterance, if any.
    pub fn session_state(&self, key: &SessionKey) -> Option<SessionState> {
        self.sessions.get(key).map(|_| SessionState::Active)
    }

    /// Id of the live session for an utterance, if any.
    pub fn session_id(&self, key: &SessionKey) -> Option<String> {
        self.sessions.get(key).map(|handle| handle.session_id.clone())
    }

    /// Processes one transcript event.
    ///
    /// Rate-limit, circuit-breaker and shutdown rejections are returned as
    /// errors; every other failure is reported as an outcome.
    pub async fn handle_event(
        self: &Arc<Self>,
        event: TranscriptEvent,
    ) -> Result<ProcessOutcome, ConversationError> {
        let started = Instant::now();
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ConversationError::ShuttingDown);
        }

        let fingerprint = MessageFingerprint {
            conversation_id: format!("{}:{}", event.room, event.participant_id),
            message_id: event.dedup_id(),
            participant_id: event.participant_id.clone(),
            text: event.text.clone(),
            is_partial: event.is_partial,
            timestamp: event.timestamp,
        };
        if self.collaborators.dedup.check_and_mark(&fingerprint).await {
            let err = ConversationError::DuplicateEvent {
                message_id: fingerprint.message_id,
            };
            debug!(participant = %event.participant_id, error = %err, "Event suppressed");
            return Ok(ProcessOutcome::new(OutcomeStatus::DuplicateBlocked, started)
                .with_reason(err.to_string()));
        }

        if !self
            .collaborators
            .rate_limiter
            .check_request_rate(&event.participant_id)
            .await
        {
            warn!(participant = %event.participant_id, "Request rate exceeded");
            return Err(ConversationError::RateLimitExceeded {
                participant: event.participant_id,
            });
        }

        if event.is_partial {
            self.handle_partial(event, started).await
        } else {
            self.handle_final(event, started).await
        }
    }

    async fn handle_partial(
        self: &Arc<Self>,
        event: TranscriptEvent,
        started: Instant,
    ) -> Result<ProcessOutcome, ConversationError> {
        let key = event.session_key();

        if self.answered.contains_key(&key) {
            return Ok(ProcessOutcome::new(OutcomeStatus::PartialIgnored, started)
                .with_reason("utterance already answered"));
        }

        if let Some(handle) = self.sessions.get(&key)
            && handle.origin == SessionOrigin::Final
        {
            debug!(%key, session_id = %handle.session_id, "Partial arrived behind a final response");
            return Ok(ProcessOutcome::new(OutcomeStatus::PartialIgnored, started)
                .with_session(handle.session_id.clone())
                .with_reason("final response in progress"));
        }

        if !self
            .utterances
            .add_partial(&key, &event.text, event.sequence, event.confidence)
        {
            return Ok(ProcessOutcome::new(OutcomeStatus::PartialIgnored, started)
                .with_reason("no significant growth"));
        }

        if let Some(handle) = self.sessions.get(&key)
            && handle.origin == SessionOrigin::Partial
        {
            handle.context.send_replace(event.text.clone());
            debug!(%key, session_id = %handle.session_id, "Session context refreshed");
            return Ok(ProcessOutcome::new(OutcomeStatus::PartialProcessed, started)
                .with_session(handle.session_id.clone()));
        }

        let Some(trigger) = self.utterances.evaluate(&key, Instant::now()) else {
            return Ok(ProcessOutcome::new(
                OutcomeStatus::NaturalPartialQueued,
                started,
            ));
        };

        self.check_model_guards(&event.participant_id).await?;

        if !self.utterances.mark_processing_started(&key) {
            return Ok(ProcessOutcome::new(OutcomeStatus::PartialIgnored, started)
                .with_reason("processing already started"));
        }

        let launch = SessionLaunch {
            key: key.clone(),
            origin: SessionOrigin::Partial,
            room: event.room,
            participant_id: event.participant_id,
            text: event.text,
            streaming: true,
        };
        match self.start_session(launch) {
            Some((session_id, _)) => {
                info!(%key, %session_id, trigger = %trigger, "Early response started");
                Ok(
                    ProcessOutcome::new(OutcomeStatus::NaturalOnlineLlmStarted, started)
                        .with_session(session_id)
                        .with_reason(trigger.as_str()),
                )
            }
            None => Ok(ProcessOutcome::new(OutcomeStatus::PartialProcessed, started)
                .with_reason("session already active")),
        }
    }

    async fn handle_final(
        self: &Arc<Self>,
        event: TranscriptEvent,
        started: Instant,
    ) -> Result<ProcessOutcome, ConversationError> {
        let key = event.session_key();

        let decision =
            self.final_gate
                .should_process(&event.participant_id, &event.text, event.confidence);
        if !decision.admitted {
            debug!(%key, reason = decision.reason, "Final transcript filtered");
            return Ok(
                ProcessOutcome::new(OutcomeStatus::FinalTranscriptFiltered, started)
                    .with_reason(decision.reason),
            );
        }

        if let Some(answered) = self.answered.get(&key) {
            let (origin, _) = *answered;
            return Ok(match origin {
                SessionOrigin::Partial => {
                    ProcessOutcome::new(OutcomeStatus::FinalIgnoredDueToPartial, started)
                        .with_reason("early response already delivered")
                }
                SessionOrigin::Final => {
                    ProcessOutcome::new(OutcomeStatus::DuplicateBlocked, started)
                        .with_reason("utterance already answered")
                }
            });
        }

        let active = self
            .sessions
            .get(&key)
            .map(|handle| (handle.session_id.clone(), handle.origin));
        if let Some((session_id, origin)) = active {
            if origin == SessionOrigin::Final {
                return Ok(ProcessOutcome::new(OutcomeStatus::DuplicateBlocked, started)
                    .with_session(session_id)
                    .with_reason("final response already in progress"));
            }
            match self.settings.coordinator.dedup_policy {
                DedupPolicy::BlockFinal => {
                    if let Some(handle) = self.sessions.get(&key) {
                        handle.context.send_replace(event.text.clone());
                    }
                    info!(%key, %session_id, "Final ignored, early response running");
                    return Ok(
                        ProcessOutcome::new(OutcomeStatus::FinalIgnoredDueToPartial, started)
                            .with_session(session_id),
                    );
                }
                DedupPolicy::CancelAndResupersede => {
                    self.cancel_session(&key, "superseded by final transcript");
                }
            }
        }

        self.check_model_guards(&event.participant_id).await?;

        if let Some(skills) = self.collaborators.skills.clone()
            && let Some(outcome) = self.route_skill(skills.as_ref(), &event, started).await
        {
            return Ok(outcome);
        }

        let streaming = self.settings.coordinator.stream_final_responses;
        let launch = SessionLaunch {
            key: key.clone(),
            origin: SessionOrigin::Final,
            room: event.room,
            participant_id: event.participant_id,
            text: event.text,
            streaming,
        };
        let Some((session_id, join)) = self.start_session(launch) else {
            return Ok(ProcessOutcome::new(OutcomeStatus::DuplicateBlocked, started)
                .with_reason("response already in progress"));
        };

        let outcome = match join.await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(%session_id, error = %e, "Final session task did not finish");
                return Ok(ProcessOutcome::new(OutcomeStatus::Cancelled, started)
                    .with_session(session_id));
            }
        };

        let mut result = ProcessOutcome::new(
            match (&outcome.state, &outcome.error) {
                (SessionState::Cancelled, _) => OutcomeStatus::Cancelled,
                (_, Some(_)) => OutcomeStatus::FallbackSpoken,
                _ if streaming => OutcomeStatus::StreamingSuccess,
                _ => OutcomeStatus::Success,
            },
            started,
        )
        .with_session(outcome.session_id);
        result.first_token_ms = outcome.first_token_ms;
        match outcome.error {
            Some(err) => {
                result.ai_response = Some(self.settings.coordinator.fallback_phrase.clone());
                result.reason = Some(err.kind().to_string());
            }
            None => result.ai_response = Some(outcome.ai_response),
        }
        Ok(result)
    }

    async fn check_model_guards(&self, participant: &str) -> Result<(), ConversationError> {
        if !self.collaborators.rate_limiter.check_ai_rate(participant).await {
            warn!(%participant, "Model call rate exceeded");
            return Err(ConversationError::RateLimitExceeded {
                participant: participant.to_string(),
            });
        }
        let (allowed, reason) = self.collaborators.circuit_breaker.should_allow_call().await;
        if !allowed {
            warn!(%participant, %reason, "Circuit breaker open");
            return Err(ConversationError::CircuitOpen(reason));
        }
        Ok(())
    }

    async fn route_skill(
        &self,
        skills: &dyn SkillRouter,
        event: &TranscriptEvent,
        started: Instant,
    ) -> Option<ProcessOutcome> {
        let conversation = self
            .conversation(&event.room, &event.participant_id)
            .await?;
        let response = match skills
            .route(&conversation, &event.participant_id, &event.text)
            .await
        {
            Ok(response) => response?,
            Err(e) => {
                warn!(participant = %event.participant_id, error = %e, "Skill routing failed");
                return None;
            }
        };

        let session_id = Uuid::new_v4().to_string();
        self.tts_queue.queue_phrase(
            &response.reply,
            &event.room,
            &session_id,
            Priority::Urgent,
            None,
            None,
        );
        if let Err(e) = self.tts_queue.join_session(&session_id).await {
            warn!(%session_id, error = %e, "Skill reply not delivered");
        }
        self.append_exchange(&conversation.id, &event.text, &response.reply)
            .await;

        info!(skill = %response.skill, activated = response.activated, "Utterance handled by skill");
        let status = if response.activated {
            OutcomeStatus::SkillActivated
        } else {
            OutcomeStatus::SkillProcessed
        };
        let mut outcome = ProcessOutcome::new(status, started)
            .with_session(session_id)
            .with_reason(response.skill);
        outcome.ai_response = Some(response.reply);
        Some(outcome)
    }

    /// Registers and spawns a session. Returns `None` if the utterance already
    /// has a live session.
    fn start_session(
        self: &Arc<Self>,
        launch: SessionLaunch,
    ) -> Option<(String, JoinHandle<SessionOutcome>)> {
        let session_id = Uuid::new_v4().to_string();
        let (context_tx, context_rx) = watch::channel(launch.text.clone());
        let cancel = CancellationToken::new();
        let progress = Arc::new(SessionProgress::default());

        match self.sessions.entry(launch.key.clone()) {
            Entry::Occupied(_) => return None,
            Entry::Vacant(vacant) => {
                vacant.insert(SessionHandle {
                    session_id: session_id.clone(),
                    origin: launch.origin,
                    context: context_tx,
                    cancel: cancel.clone(),
                    progress: progress.clone(),
                    abort: None,
                    started_at: Instant::now(),
                });
            }
        }

        let key = launch.key.clone();
        let coordinator = Arc::clone(self);
        let task_session_id = session_id.clone();
        let handle = self.tasks.spawn(async move {
            let history = coordinator
                .history(&launch.room, &launch.participant_id)
                .await;
            let session = ResponseSession {
                session_id: task_session_id,
                key: launch.key.clone(),
                room: launch.room.clone(),
                history,
                context: context_rx,
                llm: coordinator.collaborators.llm.clone(),
                tts_queue: coordinator.tts_queue.clone(),
                segmenter: coordinator.settings.segmenter.clone(),
                fallback_phrase: coordinator.settings.coordinator.fallback_phrase.clone(),
                streaming: launch.streaming,
                progress,
                cancel,
            };
            let outcome = session.run().await;
            coordinator.finish_session(&launch, &outcome).await;
            outcome
        });

        if let Some(mut entry) = self.sessions.get_mut(&key)
            && entry.session_id == session_id
        {
            entry.abort = Some(handle.abort_handle());
        }
        Some((session_id, handle))
    }

    /// Cancels the live session for an utterance and clears its pending phrases.
    fn cancel_session(&self, key: &SessionKey, reason: &str) {
        if let Some((_, handle)) = self.sessions.remove(key) {
            handle.cancel.cancel();
            let interrupted = self.tts_queue.interrupt_session(&handle.session_id);
            info!(
                %key,
                session_id = %handle.session_id,
                response_started = handle.progress.response_started(),
                cleared = interrupted.cleared_count,
                age_ms = handle.started_at.elapsed().as_millis() as u64,
                %reason,
                "Session cancelled"
            );
        }
    }

    async fn finish_session(&self, launch: &SessionLaunch, outcome: &SessionOutcome) {
        let key = &launch.key;
        let answered = outcome.state == SessionState::Completed && outcome.error.is_none();
        if answered {
            self.answered
                .insert(key.clone(), (launch.origin, Instant::now()));
        }
        self.sessions
            .remove_if(key, |_, handle| handle.session_id == outcome.session_id);

        match (&outcome.state, &outcome.error) {
            (SessionState::Cancelled, _) => {
                debug!(%key, session_id = %outcome.session_id, "Cancelled session removed");
            }
            (_, Some(err)) => {
                if matches!(err, ConversationError::UpstreamLlm(_)) {
                    self.collaborators.circuit_breaker.record_failure().await;
                }
                warn!(
                    %key,
                    session_id = %outcome.session_id,
                    error = %err,
                    status = err.status_code(),
                    "Session ended with fallback, exchange not recorded"
                );
            }
            (_, None) => {
                self.collaborators.circuit_breaker.record_success().await;
                self.utterances.remove(key);
                if let Some(conversation) = self
                    .conversation(&launch.room, &launch.participant_id)
                    .await
                {
                    self.append_exchange(&conversation.id, &outcome.user_text, &outcome.ai_response)
                        .await;
                }
            }
        }
    }

    async fn conversation(&self, room: &str, participant: &str) -> Option<ConversationRecord> {
        match self.collaborators.store.get_or_create(room, participant).await {
            Ok(conversation) => Some(conversation),
            Err(e) => {
                let err = ConversationError::Store(e.to_string());
                warn!(%room, %participant, error = %err, "Conversation lookup failed");
                None
            }
        }
    }

    async fn history(&self, room: &str, participant: &str) -> Vec<Turn> {
        let Some(conversation) = self.conversation(room, participant).await else {
            return Vec::new();
        };
        match self
            .collaborators
            .store
            .recent_history(&conversation.id, self.settings.coordinator.history_limit)
            .await
        {
            Ok(history) => history,
            Err(e) => {
                warn!(conversation_id = %conversation.id, error = %e, "History unavailable");
                Vec::new()
            }
        }
    }

    async fn append_exchange(&self, conversation_id: &str, user_text: &str, reply: &str) {
        let store = &self.collaborators.store;
        for (role, text) in [(Role::User, user_text), (Role::Assistant, reply)] {
            if let Err(e) = store.append_turn(conversation_id, role, text).await {
                warn!(%conversation_id, ?role, error = %e, "Failed to append turn");
                return;
            }
        }
    }

    /// Purges expired utterances, inactive participants and answered-utterance memory.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let expiry = self.settings.utterance.expiry();
        let before = self.answered.len();
        self.answered
            .retain(|_, (_, at)| now.saturating_duration_since(*at) < expiry);
        let report = SweepReport {
            utterances: self.utterances.sweep_expired(now),
            participants: self.final_gate.sweep_inactive(now),
            answered: before - self.answered.len(),
        };
        if report != SweepReport::default() {
            debug!(?report, "Swept conversation state");
        }
        report
    }

    /// Runs [`sweep`](Self::sweep) periodically until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let period = self.settings.coordinator.sweep_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        coordinator.sweep(Instant::now());
                    }
                }
            }
            debug!("Sweeper stopped");
        })
    }

    /// Stops accepting events, drains in-flight sessions, then aborts stragglers.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.tasks.close();
        let timeout = self.settings.coordinator.shutdown_timeout();
        info!(
            active_sessions = self.sessions.len(),
            timeout_secs = timeout.as_secs(),
            "Coordinator shutting down"
        );

        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Sessions still running after shutdown timeout, aborting"
            );
            let keys: Vec<SessionKey> = self.sessions.iter().map(|e| e.key().clone()).collect();
            for key in keys {
                if let Some((_, handle)) = self.sessions.remove(&key) {
                    handle.cancel.cancel();
                    if let Some(abort) = handle.abort {
                        abort.abort();
                    }
                }
            }
            self.tts_queue.abort_all();
            if tokio::time::timeout(Duration::from_secs(1), self.tasks.wait())
                .await
                .is_err()
            {
                warn!("Session tasks did not stop after abort");
            }
        }
        self.tts_queue.close();
        info!("Coordinator stopped");
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }
}
