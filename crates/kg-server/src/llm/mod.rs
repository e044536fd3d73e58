//! Upstream LLM / embeddings client abstraction.
//!
//! `ChatClient` and `EmbeddingsClient` are enums over concrete provider
//! implementations — add a new variant + module in `providers/` for each
//! additional backend. Provider instances are shared immutable capabilities;
//! clone them freely.
//!
//! Error classification for the retry layer lives here: a
//! [`ProviderError`] knows whether it is worth retrying.

pub mod providers;

use thiserror::Error;

// ── Error ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider misconfigured: {0}")]
    Config(String),

    /// Upstream answered with a non-success HTTP status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// Request-level timeout.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Transport failure before any HTTP status was received.
    #[error("transport error: {0}")]
    Transport(String),

    /// Upstream answered 2xx but the body was not usable.
    #[error("bad response: {0}")]
    Decode(String),
}

impl ProviderError {
    /// True for failures a retry may fix: timeouts, 429, 5xx, transport
    /// resets. Everything else (other 4xx, decode errors, misconfiguration)
    /// is permanent and surfaces immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Transport(_) => true,
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ProviderError::Timeout(e.to_string())
        } else {
            ProviderError::Transport(e.to_string())
        }
    }
}

// ── Usage accounting ──────────────────────────────────────────────────────────

/// Token usage reported by the upstream, when available.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlmUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl LlmUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Rough token estimate for rate-limit admission: ~4 chars per token.
/// Reconciled against the upstream-reported usage after the call.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64 / 4) + 1
}

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub usage: Option<LlmUsage>,
}

#[derive(Debug, Clone)]
pub struct EmbeddingsResponse {
    pub vectors: Vec<Vec<f32>>,
    pub usage: Option<LlmUsage>,
}

// ── Client enums ──────────────────────────────────────────────────────────────

/// All available chat-completion backends.
///
/// Enum dispatch avoids `dyn` trait objects; adding a backend = new module +
/// new variant + new `complete` arm.
#[derive(Debug, Clone)]
pub enum ChatClient {
    OpenAiCompatible(providers::openai_compatible::OpenAiChat),
    Dummy(providers::dummy::DummyChat),
}

impl ChatClient {
    /// One chat round-trip: optional system prompt + one user message.
    pub async fn complete(
        &self,
        system: Option<&str>,
        content: &str,
    ) -> Result<ChatResponse, ProviderError> {
        match self {
            ChatClient::OpenAiCompatible(c) => c.complete(system, content).await,
            ChatClient::Dummy(c) => c.complete(system, content).await,
        }
    }
}

/// All available embeddings backends.
#[derive(Debug, Clone)]
pub enum EmbeddingsClient {
    OpenAiCompatible(providers::openai_compatible::OpenAiEmbeddings),
    Dummy(providers::dummy::DummyEmbeddings),
}

impl EmbeddingsClient {
    /// Embed a batch of texts; one vector per input, in order.
    pub async fn embed(&self, texts: &[String]) -> Result<EmbeddingsResponse, ProviderError> {
        match self {
            EmbeddingsClient::OpenAiCompatible(c) => c.embed(texts).await,
            EmbeddingsClient::Dummy(c) => c.embed(texts).await,
        }
    }
}
