//! Data-source hooks — where the text chunks come from.
//!
//! The pipeline only ever calls `full_data()` / `incremental_data(since)`;
//! what "since" means is the hook's business, the core just forwards the
//! base version. Config selects an implementation by registry key
//! (`hooks.module`), not by import path.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

use crate::core::config::HooksConfig;

#[derive(Debug, Error)]
pub enum HookError {
    #[error("hook io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hook data error: {0}")]
    Data(String),
}

/// All registered hook implementations.
#[derive(Debug, Clone)]
pub enum Hooks {
    Sample(SampleHooks),
    ChunkFile(ChunkFileHooks),
    Static(StaticHooks),
}

impl Hooks {
    /// Every chunk the data source has; ordered.
    pub async fn full_data(&self) -> Result<Vec<String>, HookError> {
        match self {
            Hooks::Sample(h) => h.full_data(),
            Hooks::ChunkFile(h) => h.full_data().await,
            Hooks::Static(h) => h.full_data(),
        }
    }

    /// Chunks produced since the given version; ordered.
    pub async fn incremental_data(&self, since_version: &str) -> Result<Vec<String>, HookError> {
        match self {
            Hooks::Sample(h) => h.incremental_data(since_version),
            Hooks::ChunkFile(h) => h.incremental_data(since_version).await,
            Hooks::Static(h) => h.incremental_data(since_version),
        }
    }
}

/// Resolve the registry key from config.
pub fn build(cfg: &HooksConfig) -> Result<Hooks, HookError> {
    match cfg.module.as_str() {
        "sample" => Ok(Hooks::Sample(SampleHooks)),
        "chunk_file" => {
            let path = cfg.path.clone().ok_or_else(|| {
                HookError::Data("hooks.path is required for the chunk_file hook".into())
            })?;
            Ok(Hooks::ChunkFile(ChunkFileHooks::new(path)))
        }
        other => Err(HookError::Data(format!("unknown hooks module: {other}"))),
    }
}

// ── Sample ───────────────────────────────────────────────────────────────────

/// Fixed demo chunks for quickstart runs; point `hooks` at your own data
/// source before building anything real.
#[derive(Debug, Clone)]
pub struct SampleHooks;

impl SampleHooks {
    fn full_data(&self) -> Result<Vec<String>, HookError> {
        Ok(vec![
            "Alice knows Bob.".to_string(),
            "Bob lives in Paris.".to_string(),
        ])
    }

    fn incremental_data(&self, _since_version: &str) -> Result<Vec<String>, HookError> {
        Ok(vec!["Alice moved to Berlin.".to_string()])
    }
}

// ── Chunk file ───────────────────────────────────────────────────────────────

/// JSONL-backed hook: one record per line,
/// `{"created_at_ms": 1700000000000, "content": "..."}`.
///
/// `incremental_data` filters on `created_at_ms` strictly greater than the
/// base version's millisecond value.
#[derive(Debug, Clone)]
pub struct ChunkFileHooks {
    path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct ChunkRecord {
    created_at_ms: u64,
    content: String,
}

impl ChunkFileHooks {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    async fn read_records(&self) -> Result<Vec<ChunkRecord>, HookError> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        raw.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|line| {
                serde_json::from_str::<ChunkRecord>(line)
                    .map_err(|e| HookError::Data(format!("bad chunk record: {e}")))
            })
            .collect()
    }

    async fn full_data(&self) -> Result<Vec<String>, HookError> {
        Ok(self
            .read_records()
            .await?
            .into_iter()
            .map(|r| r.content)
            .filter(|c| !c.is_empty())
            .collect())
    }

    async fn incremental_data(&self, since_version: &str) -> Result<Vec<String>, HookError> {
        let since: u64 = since_version.parse().map_err(|_| {
            HookError::Data(format!("base version is not a millisecond timestamp: {since_version}"))
        })?;
        Ok(self
            .read_records()
            .await?
            .into_iter()
            .filter(|r| r.created_at_ms > since)
            .map(|r| r.content)
            .filter(|c| !c.is_empty())
            .collect())
    }
}

// ── Static (tests) ───────────────────────────────────────────────────────────

/// In-process fixed chunk lists; can be armed to fail for error-path tests.
#[derive(Debug, Clone, Default)]
pub struct StaticHooks {
    pub full: Vec<String>,
    pub incremental: Vec<String>,
    pub fail_with: Option<String>,
}

impl StaticHooks {
    pub fn new(full: Vec<String>, incremental: Vec<String>) -> Self {
        Self { full, incremental, fail_with: None }
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self { fail_with: Some(message.into()), ..Default::default() }
    }

    fn full_data(&self) -> Result<Vec<String>, HookError> {
        match &self.fail_with {
            Some(m) => Err(HookError::Data(m.clone())),
            None => Ok(self.full.clone()),
        }
    }

    fn incremental_data(&self, _since_version: &str) -> Result<Vec<String>, HookError> {
        match &self.fail_with {
            Some(m) => Err(HookError::Data(m.clone())),
            None => Ok(self.incremental.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cfg(module: &str, path: Option<&str>) -> HooksConfig {
        HooksConfig {
            module: module.to_string(),
            full: "full_data".to_string(),
            incremental: "incremental_data".to_string(),
            path: path.map(PathBuf::from),
        }
    }

    #[test]
    fn registry_rejects_unknown_modules() {
        assert!(build(&cfg("sample", None)).is_ok());
        assert!(build(&cfg("chunk_file", Some("/tmp/x.jsonl"))).is_ok());
        assert!(build(&cfg("chunk_file", None)).is_err());
        assert!(build(&cfg("postgres", None)).is_err());
    }

    #[tokio::test]
    async fn sample_hook_returns_demo_chunks() {
        let hooks = build(&cfg("sample", None)).unwrap();
        let full = hooks.full_data().await.unwrap();
        assert_eq!(full.len(), 2);
        assert!(!hooks.incremental_data("1700000000000").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chunk_file_filters_by_created_at() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, r#"{{"created_at_ms": 100, "content": "old"}}"#).unwrap();
        writeln!(f, r#"{{"created_at_ms": 200, "content": "newer"}}"#).unwrap();
        writeln!(f, r#"{{"created_at_ms": 300, "content": "newest"}}"#).unwrap();

        let hooks = ChunkFileHooks::new(f.path().to_path_buf());
        assert_eq!(hooks.full_data().await.unwrap().len(), 3);
        assert_eq!(
            hooks.incremental_data("200").await.unwrap(),
            vec!["newest".to_string()]
        );
    }

    #[tokio::test]
    async fn chunk_file_rejects_bad_records_and_versions() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "not json").unwrap();
        let hooks = ChunkFileHooks::new(f.path().to_path_buf());
        assert!(hooks.full_data().await.is_err());
        assert!(hooks.incremental_data("not-a-version").await.is_err());
    }

    #[tokio::test]
    async fn chunk_file_missing_file_is_io_error() {
        let hooks = ChunkFileHooks::new(PathBuf::from("/nonexistent/chunks.jsonl"));
        assert!(matches!(hooks.full_data().await, Err(HookError::Io(_))));
    }

    #[tokio::test]
    async fn static_hook_can_fail_on_demand() {
        let hooks = Hooks::Static(StaticHooks::failing("source offline"));
        let err = hooks.full_data().await.unwrap_err();
        assert!(err.to_string().contains("source offline"));
    }
}
