//! Text → knowledge-graph extraction.
//!
//! The pipeline treats extraction as a callable capability: chunks in,
//! [`KnowledgeGraph`] out, optionally seeded with the previous version's
//! graph. [`Extractor::Llm`] is the real implementation;
//! [`Extractor::Scripted`] returns pre-seeded graphs for tests and offline
//! smoke runs.

pub mod llm;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::kg::KnowledgeGraph;
use crate::throttle::CallError;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("upstream call failed: {0}")]
    Call(#[from] CallError),

    #[error("unusable extraction output: {0}")]
    Parse(String),

    #[error("{0}")]
    Empty(String),
}

#[derive(Debug, Clone)]
pub enum Extractor {
    Llm(llm::LlmExtractor),
    Scripted(ScriptedExtractor),
}

impl Extractor {
    /// Build a graph from `chunks`, merging into `base` when present.
    /// `obs_timestamp` (RFC 3339) stamps fact provenance.
    pub async fn build(
        &self,
        chunks: &[String],
        base: Option<KnowledgeGraph>,
        obs_timestamp: &str,
        cancel: &CancellationToken,
    ) -> Result<KnowledgeGraph, ExtractError> {
        match self {
            Extractor::Llm(e) => e.build(chunks, base, obs_timestamp, cancel).await,
            Extractor::Scripted(e) => e.build(base, cancel).await,
        }
    }
}

/// Pops one queued graph per build call; merges it over the base the same
/// way the real extractor does.
#[derive(Debug, Clone)]
pub struct ScriptedExtractor {
    graphs: Arc<Mutex<VecDeque<Result<KnowledgeGraph, String>>>>,
    delay: Option<std::time::Duration>,
}

impl ScriptedExtractor {
    pub fn new(graphs: Vec<KnowledgeGraph>) -> Self {
        Self {
            graphs: Arc::new(Mutex::new(graphs.into_iter().map(Ok).collect())),
            delay: None,
        }
    }

    /// Queue a failure outcome for the next build call.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            graphs: Arc::new(Mutex::new(VecDeque::from([Err(message.into())]))),
            delay: None,
        }
    }

    /// Hold each build call for `delay` first — lets tests keep the writer
    /// slot occupied or force a pipeline timeout.
    pub fn with_delay(mut self, delay: std::time::Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    async fn build(
        &self,
        base: Option<KnowledgeGraph>,
        cancel: &CancellationToken,
    ) -> Result<KnowledgeGraph, ExtractError> {
        if let Some(delay) = self.delay {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ExtractError::Call(CallError::Cancelled));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
        let next = self
            .graphs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| ExtractError::Empty("scripted graphs exhausted".into()))?;
        let produced = next.map_err(ExtractError::Parse)?;

        let mut merged = base.unwrap_or_default();
        for e in produced.entities {
            merged.upsert_entity(e);
        }
        for r in produced.relationships {
            merged.upsert_relationship(r);
        }
        Ok(merged)
    }
}
