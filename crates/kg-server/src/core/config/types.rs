//! Resolved configuration types.
//!
//! Everything here is immutable after load; secrets are already resolved
//! (inline value or `*_env` indirection) by the time these exist.

use std::path::PathBuf;

/// HTTP server binding and CORS policy.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed origins; `["*"]` means any origin.
    pub cors_allow_origins: Vec<String>,
}

/// Graph database connection.
///
/// A `uri` starting with `memory:` selects the in-process stores (dev/test);
/// anything else is treated as a Neo4j HTTP endpoint such as
/// `http://localhost:7474`.
#[derive(Debug, Clone)]
pub struct Neo4jConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl Neo4jConfig {
    /// True when the in-memory backend is selected instead of Neo4j.
    pub fn is_memory(&self) -> bool {
        self.uri.starts_with("memory:")
    }
}

/// Old-version cleanup policy applied after each successful commit.
#[derive(Debug, Clone, Copy)]
pub struct RetentionConfig {
    pub max_versions: u32,
    pub enable_cleanup: bool,
}

/// Defaults and caps for `/kg/query`.
#[derive(Debug, Clone, Copy)]
pub struct QueryConfig {
    pub default_limit_nodes: usize,
    pub default_limit_edges: usize,
    pub default_depth: usize,
    pub max_depth: usize,
    pub max_seed_nodes: usize,
}

/// Data-hook selection.
///
/// `module` is a registry key (`sample`, `chunk_file`, …), not an import
/// path; `full` and `incremental` name the two operations for operators
/// reading the config but are fixed per registry entry.
#[derive(Debug, Clone)]
pub struct HooksConfig {
    pub module: String,
    pub full: String,
    pub incremental: String,
    /// Backing file for the `chunk_file` hook.
    pub path: Option<PathBuf>,
}

/// Pipeline-level limits.
#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    /// Wall-clock bound on one build/update pipeline; `0` disables it.
    pub timeout_s: u64,
}

/// Requests/tokens per 60-second window; `0` disables that bucket.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub rpm: u32,
    pub tpm: u32,
}

/// Cap on simultaneously outstanding upstream calls; `0` means unbounded.
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyConfig {
    pub max_in_flight: u32,
}

/// Exponential backoff schedule for transient upstream failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_s: f64,
    pub max_backoff_s: f64,
    pub backoff_multiplier: f64,
}

/// Chat-completion upstream used by the extractor.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// `openai_compatible` or `dummy`.
    pub provider: String,
    pub api_key: Option<String>,
    /// Full chat-completions endpoint URL.
    pub api_base_url: String,
    pub model: String,
    pub max_tokens: Option<u32>,
    pub temperature: f32,
    pub repetition_penalty: Option<f32>,
    pub rate_limit: RateLimitConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
}

/// Embeddings upstream used by the extractor.
#[derive(Debug, Clone)]
pub struct EmbeddingsConfig {
    /// `openai_compatible` or `dummy`.
    pub provider: String,
    pub api_key: Option<String>,
    /// Full embeddings endpoint URL.
    pub api_base_url: String,
    pub model: String,
    pub rate_limit: RateLimitConfig,
    pub concurrency: ConcurrencyConfig,
    pub retry: RetryConfig,
}

/// Fully-resolved service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub neo4j: Neo4jConfig,
    pub retention: RetentionConfig,
    pub query: QueryConfig,
    pub hooks: HooksConfig,
    pub task: TaskConfig,
    pub llm: LlmConfig,
    pub embeddings: EmbeddingsConfig,
    pub log_level: String,
}
