//! Provider construction — maps config `provider` keys to backends.

pub mod dummy;
pub mod openai_compatible;

use crate::core::config::{EmbeddingsConfig, LlmConfig};
use crate::llm::{ChatClient, EmbeddingsClient, ProviderError};

/// Build the chat client named by `llm.provider`.
pub fn build_chat(cfg: &LlmConfig) -> Result<ChatClient, ProviderError> {
    match cfg.provider.as_str() {
        "openai_compatible" => Ok(ChatClient::OpenAiCompatible(
            openai_compatible::OpenAiChat::new(cfg)?,
        )),
        "dummy" => Ok(ChatClient::Dummy(dummy::DummyChat::echo())),
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

/// Build the embeddings client named by `embeddings.provider`.
pub fn build_embeddings(cfg: &EmbeddingsConfig) -> Result<EmbeddingsClient, ProviderError> {
    match cfg.provider.as_str() {
        "openai_compatible" => Ok(EmbeddingsClient::OpenAiCompatible(
            openai_compatible::OpenAiEmbeddings::new(cfg)?,
        )),
        "dummy" => Ok(EmbeddingsClient::Dummy(dummy::DummyEmbeddings)),
        other => Err(ProviderError::UnknownProvider(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{ConcurrencyConfig, RateLimitConfig, RetryConfig};

    fn llm_cfg(provider: &str) -> LlmConfig {
        LlmConfig {
            provider: provider.to_string(),
            api_key: None,
            api_base_url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
            model: "test-model".to_string(),
            max_tokens: None,
            temperature: 0.0,
            repetition_penalty: None,
            rate_limit: RateLimitConfig { rpm: 0, tpm: 0 },
            concurrency: ConcurrencyConfig { max_in_flight: 0 },
            retry: RetryConfig {
                max_retries: 0,
                initial_backoff_s: 1.0,
                max_backoff_s: 30.0,
                backoff_multiplier: 2.0,
            },
        }
    }

    #[test]
    fn known_providers_build() {
        assert!(build_chat(&llm_cfg("openai_compatible")).is_ok());
        assert!(build_chat(&llm_cfg("dummy")).is_ok());
    }

    #[test]
    fn unknown_provider_errors() {
        let err = build_chat(&llm_cfg("quantum")).unwrap_err();
        assert!(err.to_string().contains("quantum"));
    }
}
