//! Dummy providers — deterministic stand-ins for tests and keyless startup.
//!
//! `DummyChat::echo()` reflects the input; `DummyChat::with_replies` pops a
//! queued reply per call, which lets extractor tests script exact upstream
//! output without a network.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::llm::{ChatResponse, EmbeddingsResponse, ProviderError};

#[derive(Debug, Clone)]
pub struct DummyChat {
    replies: Option<Arc<Mutex<VecDeque<String>>>>,
}

impl DummyChat {
    /// Echo mode: returns the user content prefixed with `[echo]`.
    pub fn echo() -> Self {
        Self { replies: None }
    }

    /// Scripted mode: each call pops the next reply; errors when exhausted.
    pub fn with_replies(replies: Vec<String>) -> Self {
        Self {
            replies: Some(Arc::new(Mutex::new(replies.into()))),
        }
    }

    pub async fn complete(
        &self,
        _system: Option<&str>,
        content: &str,
    ) -> Result<ChatResponse, ProviderError> {
        let text = match &self.replies {
            None => format!("[echo] {content}"),
            Some(q) => q
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .ok_or_else(|| ProviderError::Decode("scripted replies exhausted".into()))?,
        };
        Ok(ChatResponse { text, usage: None })
    }
}

#[derive(Debug, Clone)]
pub struct DummyEmbeddings;

impl DummyEmbeddings {
    /// One fixed-size vector per input, derived from text length so equal
    /// inputs embed equally.
    pub async fn embed(&self, texts: &[String]) -> Result<EmbeddingsResponse, ProviderError> {
        let vectors = texts
            .iter()
            .map(|t| {
                let x = (t.len() % 97) as f32 / 97.0;
                vec![x, 1.0 - x, 0.5]
            })
            .collect();
        Ok(EmbeddingsResponse { vectors, usage: None })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echo_prefixes_reply() {
        let c = DummyChat::echo();
        assert_eq!(c.complete(None, "hello").await.unwrap().text, "[echo] hello");
    }

    #[tokio::test]
    async fn scripted_replies_pop_in_order() {
        let c = DummyChat::with_replies(vec!["one".into(), "two".into()]);
        assert_eq!(c.complete(None, "a").await.unwrap().text, "one");
        assert_eq!(c.complete(None, "b").await.unwrap().text, "two");
        assert!(c.complete(None, "c").await.is_err());
    }

    #[tokio::test]
    async fn embeddings_are_deterministic() {
        let e = DummyEmbeddings;
        let a = e.embed(&["same".into()]).await.unwrap();
        let b = e.embed(&["same".into()]).await.unwrap();
        assert_eq!(a.vectors, b.vectors);
        assert_eq!(a.vectors[0].len(), 3);
    }
}
