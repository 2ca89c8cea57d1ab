use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use parley_conversation::{
    CircuitBreaker, ConversationRecord, GenerateRequest, PublishRequest, RateLimiter,
    SkillResponse, SkillRouter, StreamingLlmClient, TokenStream, TtsClient,
};
use tokio::sync::watch;

/// Language model that streams a fixed reply word by word.
pub struct ScriptedLlm {
    reply: String,
    token_delay: Duration,
    fail: AtomicBool,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    contexts: Mutex<Vec<watch::Receiver<String>>>,
}

impl ScriptedLlm {
    pub fn new(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            token_delay: Duration::from_millis(20),
            fail: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Streams two tokens, then fails.
    pub fn failing(self) -> Self {
        self.fail.store(true, Ordering::SeqCst);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// User text of each request, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Latest context value seen by the nth request.
    pub fn latest_context(&self, call: usize) -> Option<String> {
        self.contexts
            .lock()
            .get(call)
            .map(|context| context.borrow().clone())
    }
}

#[async_trait]
impl StreamingLlmClient for ScriptedLlm {
    async fn generate(&self, request: GenerateRequest) -> anyhow::Result<TokenStream> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(request.text.clone());
        self.contexts.lock().push(request.context.clone());

        let mut tokens: Vec<anyhow::Result<String>> = self
            .reply
            .split_inclusive(' ')
            .map(|token| Ok(token.to_string()))
            .collect();
        if self.fail.load(Ordering::SeqCst) {
            tokens.truncate(2);
            tokens.push(Err(anyhow::anyhow!("upstream stream reset")));
        }

        let delay = self.token_delay;
        Ok(futures::stream::iter(tokens)
            .then(move |token| async move {
                tokio::time::sleep(delay).await;
                token
            })
            .boxed())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Speech synthesis that records every phrase it is asked to speak.
pub struct RecordingTts {
    spoken: Mutex<Vec<String>>,
    delay: Duration,
}

impl RecordingTts {
    pub fn new() -> Self {
        Self {
            spoken: Mutex::new(Vec::new()),
            delay: Duration::from_millis(10),
        }
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().clone()
    }
}

impl Default for RecordingTts {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TtsClient for RecordingTts {
    async fn publish(&self, request: PublishRequest) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.spoken.lock().push(request.text);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Rate limiter and circuit breaker that tests can flip at runtime.
pub struct SwitchableGuards {
    request_allowed: AtomicBool,
    ai_allowed: AtomicBool,
    breaker_reason: Mutex<Option<String>>,
    successes: AtomicUsize,
    failures: AtomicUsize,
}

impl SwitchableGuards {
    pub fn new() -> Self {
        Self {
            request_allowed: AtomicBool::new(true),
            ai_allowed: AtomicBool::new(true),
            breaker_reason: Mutex::new(None),
            successes: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    pub fn set_request_allowed(&self, allowed: bool) {
        self.request_allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn set_ai_allowed(&self, allowed: bool) {
        self.ai_allowed.store(allowed, Ordering::SeqCst);
    }

    pub fn open_breaker(&self, reason: &str) {
        *self.breaker_reason.lock() = Some(reason.to_string());
    }

    pub fn close_breaker(&self) {
        *self.breaker_reason.lock() = None;
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl Default for SwitchableGuards {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiter for SwitchableGuards {
    async fn check_request_rate(&self, _participant: &str) -> bool {
        self.request_allowed.load(Ordering::SeqCst)
    }

    async fn check_ai_rate(&self, _participant: &str) -> bool {
        self.ai_allowed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CircuitBreaker for SwitchableGuards {
    async fn should_allow_call(&self) -> (bool, String) {
        match self.breaker_reason.lock().clone() {
            Some(reason) => (false, reason),
            None => (true, String::new()),
        }
    }

    async fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
    }

    async fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }
}

/// Claims utterances starting with "timer"; the first claim activates the skill.
#[derive(Default)]
pub struct TimerSkill {
    active: AtomicBool,
}

#[async_trait]
impl SkillRouter for TimerSkill {
    async fn route(
        &self,
        _conversation: &ConversationRecord,
        _participant: &str,
        text: &str,
    ) -> anyhow::Result<Option<SkillResponse>> {
        if !text.to_lowercase().starts_with("timer") {
            return Ok(None);
        }
        let activated = !self.active.swap(true, Ordering::SeqCst);
        Ok(Some(SkillResponse {
            skill: "timer".to_string(),
            reply: "Timer set for five minutes.".to_string(),
            activated,
        }))
    }
}
