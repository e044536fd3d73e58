//! OpenAI-compatible chat and embeddings clients.
//!
//! Covers OpenAI itself plus compatible local servers and hosted
//! alternatives. All wire types are private to this module — callers only
//! see [`ChatResponse`](crate::llm::ChatResponse) /
//! [`EmbeddingsResponse`](crate::llm::EmbeddingsResponse).

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::core::config::{EmbeddingsConfig, LlmConfig};
use crate::llm::{ChatResponse, EmbeddingsResponse, LlmUsage, ProviderError};

const REQUEST_TIMEOUT_SECS: u64 = 300;

// ── Chat ─────────────────────────────────────────────────────────────────────

/// Adapter for any HTTP endpoint implementing `/v1/chat/completions`.
///
/// Constructed once at startup, then cheaply cloned because
/// `reqwest::Client` is an `Arc` internally.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    client: Client,
    api_base_url: String,
    model: String,
    temperature: f32,
    max_tokens: Option<u32>,
    repetition_penalty: Option<f32>,
    api_key: Option<String>,
}

impl OpenAiChat {
    pub fn new(cfg: &LlmConfig) -> Result<Self, ProviderError> {
        if cfg.model.trim().is_empty() {
            return Err(ProviderError::Config("llm.model must not be empty".into()));
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base_url: cfg.api_base_url.clone(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
            repetition_penalty: cfg.repetition_penalty,
            api_key: cfg.api_key.clone(),
        })
    }

    /// Send `content` as the user message and optionally `system` as the
    /// system prompt. One round-trip; retry policy lives with the caller.
    pub async fn complete(
        &self,
        system: Option<&str>,
        content: &str,
    ) -> Result<ChatResponse, ProviderError> {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(Message { role: "system", content: sys.to_string() });
        }
        messages.push(Message { role: "user", content: content.to_string() });

        let payload = ChatCompletionRequest {
            model: &self.model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            repetition_penalty: self.repetition_penalty,
        };

        debug!(model = %self.model, content_len = content.len(), "sending chat request");
        if tracing::enabled!(tracing::Level::TRACE) {
            let json = serde_json::to_string(&payload)
                .unwrap_or_else(|e| format!("<serialization failed: {e}>"));
            trace!(payload = %json, "full chat request payload");
        }

        let mut req = self.client.post(&self.api_base_url).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = check_status(req.send().await?).await?;

        let parsed = response
            .json::<ChatCompletionResponse>()
            .await
            .map_err(|e| ProviderError::Decode(format!("failed to parse response body: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProviderError::Decode("empty or missing content in response".into()))?;

        let usage = parsed.usage.map(|u| LlmUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: u.completion_tokens,
        });

        Ok(ChatResponse { text, usage })
    }
}

// ── Embeddings ───────────────────────────────────────────────────────────────

/// Adapter for any HTTP endpoint implementing `/v1/embeddings`.
#[derive(Debug, Clone)]
pub struct OpenAiEmbeddings {
    client: Client,
    api_base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiEmbeddings {
    pub fn new(cfg: &EmbeddingsConfig) -> Result<Self, ProviderError> {
        if cfg.model.trim().is_empty() {
            return Err(ProviderError::Config("embeddings.model must not be empty".into()));
        }
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_base_url: cfg.api_base_url.clone(),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone(),
        })
    }

    pub async fn embed(&self, texts: &[String]) -> Result<EmbeddingsResponse, ProviderError> {
        let payload = EmbeddingsRequest { model: &self.model, input: texts };

        debug!(model = %self.model, batch = texts.len(), "sending embeddings request");

        let mut req = self.client.post(&self.api_base_url).json(&payload);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = check_status(req.send().await?).await?;

        let mut parsed = response
            .json::<EmbeddingsApiResponse>()
            .await
            .map_err(|e| ProviderError::Decode(format!("failed to parse response body: {e}")))?;

        if parsed.data.len() != texts.len() {
            return Err(ProviderError::Decode(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                parsed.data.len()
            )));
        }

        // Upstream order is by `index`, not necessarily arrival order.
        parsed.data.sort_by_key(|d| d.index);
        let vectors = parsed.data.into_iter().map(|d| d.embedding).collect();
        let usage = parsed.usage.map(|u| LlmUsage {
            input_tokens: u.prompt_tokens,
            output_tokens: 0,
        });

        Ok(EmbeddingsResponse { vectors, usage })
    }
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repetition_penalty: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<UsageData>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageData {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsApiResponse {
    data: Vec<EmbeddingDatum>,
    #[serde(default)]
    usage: Option<UsageData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

// Error envelope used by OpenAI and compatible APIs.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Consume the response and return it if successful, or a structured error
/// carrying the HTTP status for transient/permanent classification.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read error body>".to_string());

    let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(env) => env.error.message,
        Err(_) => body,
    };

    Err(ProviderError::Http { status: status.as_u16(), message })
}
