//! One cancellable response run: stream model tokens, segment them into
//! phrases, admit the phrases for synthesis.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::StreamExt;
use parking_lot::Mutex;
use parley_config::SegmenterSettings;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::SessionKey;
use crate::clients::{GenerateRequest, StreamingLlmClient, Turn};
use crate::error::{ConversationError, ConversationResult};
use crate::segmenter::PhraseSegmenter;
use crate::tts_queue::{Priority, TtsAdmissionQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Active,
    Completed,
    Cancelled,
}

/// Which admission path started a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOrigin {
    Partial,
    Final,
}

/// Progress shared between a running session and its registry entry.
#[derive(Default)]
pub(crate) struct SessionProgress {
    response_started: AtomicBool,
    accumulated_text: Mutex<String>,
    first_token_ms: Mutex<Option<u64>>,
}

impl SessionProgress {
    /// Whether the first phrase has been admitted for synthesis.
    pub(crate) fn response_started(&self) -> bool {
        self.response_started.load(Ordering::SeqCst)
    }

    pub(crate) fn accumulated_text(&self) -> String {
        self.accumulated_text.lock().clone()
    }
}

/// Registry entry for a live session.
pub(crate) struct SessionHandle {
    pub session_id: String,
    pub origin: SessionOrigin,
    pub context: watch::Sender<String>,
    pub cancel: CancellationToken,
    pub progress: Arc<SessionProgress>,
    pub abort: Option<tokio::task::AbortHandle>,
    pub started_at: Instant,
}

/// How a session ended.
#[derive(Debug)]
pub(crate) struct SessionOutcome {
    pub session_id: String,
    pub state: SessionState,
    /// Latest user text when the session ended.
    pub user_text: String,
    pub ai_response: String,
    pub first_token_ms: Option<u64>,
    /// Set when the run failed and the fallback phrase was spoken instead.
    pub error: Option<ConversationError>,
}

pub(crate) struct ResponseSession {
    pub session_id: String,
    pub key: SessionKey,
    pub room: String,
    pub history: Vec<Turn>,
    pub context: watch::Receiver<String>,
    pub llm: Arc<dyn StreamingLlmClient>,
    pub tts_queue: Arc<TtsAdmissionQueue>,
    pub segmenter: SegmenterSettings,
    pub fallback_phrase: String,
    /// Speak phrases as they are segmented rather than once the reply is complete.
    pub streaming: bool,
    pub progress: Arc<SessionProgress>,
    pub cancel: CancellationToken,
}

impl ResponseSession {
    pub async fn run(self) -> SessionOutcome {
        let started = Instant::now();
        info!(
            session_id = %self.session_id,
            key = %self.key,
            llm = %self.llm.name(),
            "Response session started"
        );

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ConversationError::Cancelled),
            result = self.stream_response(started) => result,
        };

        let (state, error) = match result {
            Ok(()) => {
                info!(
                    session_id = %self.session_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Response session completed"
                );
                (SessionState::Completed, None)
            }
            Err(ConversationError::Cancelled) => {
                debug!(session_id = %self.session_id, "Response session cancelled");
                self.tts_queue.detach_session(&self.session_id);
                (SessionState::Cancelled, None)
            }
            Err(err) => {
                warn!(session_id = %self.session_id, error = %err, "Response session failed");
                self.speak_fallback().await;
                (SessionState::Completed, Some(err))
            }
        };

        SessionOutcome {
            session_id: self.session_id.clone(),
            state,
            user_text: self.context.borrow().clone(),
            ai_response: self.progress.accumulated_text(),
            first_token_ms: *self.progress.first_token_ms.lock(),
            error,
        }
    }

    async fn stream_response(&self, started: Instant) -> ConversationResult<()> {
        let request = GenerateRequest {
            session_id: self.session_id.clone(),
            text: self.context.borrow().clone(),
            history: self.history.clone(),
            context: self.context.clone(),
        };
        let mut tokens = self
            .llm
            .generate(request)
            .await
            .map_err(|e| ConversationError::UpstreamLlm(e.to_string()))?;

        let mut segmenter = PhraseSegmenter::new(self.segmenter.clone());
        while let Some(token) = tokens.next().await {
            let token = token.map_err(|e| ConversationError::UpstreamLlm(e.to_string()))?;
            {
                let mut first_token_ms = self.progress.first_token_ms.lock();
                if first_token_ms.is_none() {
                    *first_token_ms = Some(started.elapsed().as_millis() as u64);
                }
            }
            self.progress.accumulated_text.lock().push_str(&token);

            if self.streaming
                && let Some(phrase) = segmenter.add_token(&token)
            {
                self.speak(&phrase, false);
            }
        }

        if self.streaming {
            if let Some(rest) = segmenter.flush_remaining() {
                self.speak(&rest, true);
            }
        } else {
            let reply = self.progress.accumulated_text();
            self.speak(&reply, true);
        }

        self.tts_queue.join_session(&self.session_id).await
    }

    /// The first phrase of a response is urgent; the closing one is final.
    fn speak(&self, phrase: &str, last: bool) {
        let first = !self.progress.response_started.swap(true, Ordering::SeqCst);
        let priority = if first {
            Priority::Urgent
        } else if last {
            Priority::Final
        } else {
            Priority::Continuation
        };
        self.tts_queue
            .queue_phrase(phrase, &self.room, &self.session_id, priority, None, None);
    }

    async fn speak_fallback(&self) {
        self.tts_queue.queue_phrase(
            &self.fallback_phrase,
            &self.room,
            &self.session_id,
            Priority::Urgent,
            None,
            None,
        );
        if let Err(e) = self.tts_queue.join_session(&self.session_id).await {
            warn!(session_id = %self.session_id, error = %e, "Fallback phrase not delivered");
        }
    }
}
