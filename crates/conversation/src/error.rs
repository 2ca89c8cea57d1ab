use thiserror::Error;

pub type ConversationResult<T> = Result<T, ConversationError>;

#[derive(Debug, Clone, Error)]
pub enum ConversationError {
    #[error("Rate limit exceeded for participant {participant}")]
    RateLimitExceeded { participant: String },
    #[error("Circuit open: {0}")]
    CircuitOpen(String),
    #[error("Duplicate event: {message_id}")]
    DuplicateEvent { message_id: String },
    #[error("Speech synthesis failed: {0}")]
    UpstreamSynthesis(String),
    #[error("Language model failed: {0}")]
    UpstreamLlm(String),
    #[error("Work cancelled")]
    Cancelled,
    #[error("Conversation store failed: {0}")]
    Store(String),
    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

impl ConversationError {
    /// HTTP-equivalent status the transcript caller should surface.
    pub fn status_code(&self) -> u16 {
        match self {
            ConversationError::RateLimitExceeded { .. } => 429,
            ConversationError::CircuitOpen(_) => 503,
            ConversationError::DuplicateEvent { .. } => 200,
            ConversationError::UpstreamSynthesis(_) => 502,
            ConversationError::UpstreamLlm(_) => 502,
            ConversationError::Cancelled => 499,
            ConversationError::Store(_) => 500,
            ConversationError::ShuttingDown => 503,
        }
    }

    /// Short machine-readable kind, used in logs and outcome reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            ConversationError::RateLimitExceeded { .. } => "rate_limited",
            ConversationError::CircuitOpen(_) => "circuit_open",
            ConversationError::DuplicateEvent { .. } => "duplicate",
            ConversationError::UpstreamSynthesis(_) => "upstream_synthesis",
            ConversationError::UpstreamLlm(_) => "upstream_llm",
            ConversationError::Cancelled => "cancelled",
            ConversationError::Store(_) => "store",
            ConversationError::ShuttingDown => "shutting_down",
        }
    }
}
