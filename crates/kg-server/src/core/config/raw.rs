//! Raw YAML deserialization types.
//!
//! These structs mirror the YAML file shape and use `serde` defaults.
//! The `load` module converts them into the public `types` structs and
//! resolves `*_env` secret indirection.

use serde::Deserialize;

// ── Top-level ────────────────────────────────────────────────────────────────

/// Raw YAML shape — serde target before resolution.
#[derive(Deserialize, Default)]
pub(super) struct RawConfig {
    #[serde(default)]
    pub server: RawServer,
    #[serde(default)]
    pub neo4j: RawNeo4j,
    #[serde(default)]
    pub retention: RawRetention,
    #[serde(default)]
    pub query: RawQuery,
    #[serde(default)]
    pub hooks: RawHooks,
    #[serde(default)]
    pub task: RawTask,
    #[serde(default)]
    pub llm: RawLlm,
    #[serde(default)]
    pub embeddings: RawEmbeddings,
    #[serde(default)]
    pub logging: RawLogging,
}

// ── Server ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawServer {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_cors")]
    pub cors_allow_origins: Vec<String>,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_allow_origins: default_cors(),
        }
    }
}

// ── Neo4j ────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawNeo4j {
    #[serde(default = "default_neo4j_uri")]
    pub uri: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_env: Option<String>,
    #[serde(default)]
    pub database: Option<String>,
}

impl Default for RawNeo4j {
    fn default() -> Self {
        Self {
            uri: default_neo4j_uri(),
            username: None,
            password: None,
            password_env: None,
            database: None,
        }
    }
}

// ── Retention / query / hooks / task ────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawRetention {
    #[serde(default = "default_max_versions")]
    pub max_versions: u32,
    #[serde(default = "default_true")]
    pub enable_cleanup: bool,
}

impl Default for RawRetention {
    fn default() -> Self {
        Self {
            max_versions: default_max_versions(),
            enable_cleanup: true,
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawQuery {
    #[serde(default = "default_limit_nodes")]
    pub default_limit_nodes: usize,
    #[serde(default = "default_limit_edges")]
    pub default_limit_edges: usize,
    #[serde(default = "default_depth")]
    pub default_depth: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_max_seed_nodes")]
    pub max_seed_nodes: usize,
}

impl Default for RawQuery {
    fn default() -> Self {
        Self {
            default_limit_nodes: default_limit_nodes(),
            default_limit_edges: default_limit_edges(),
            default_depth: default_depth(),
            max_depth: default_max_depth(),
            max_seed_nodes: default_max_seed_nodes(),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawHooks {
    #[serde(default = "default_hooks_module")]
    pub module: String,
    #[serde(default = "default_hooks_full")]
    pub full: String,
    #[serde(default = "default_hooks_incremental")]
    pub incremental: String,
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for RawHooks {
    fn default() -> Self {
        Self {
            module: default_hooks_module(),
            full: default_hooks_full(),
            incremental: default_hooks_incremental(),
            path: None,
        }
    }
}

#[derive(Deserialize, Default)]
pub(super) struct RawTask {
    #[serde(default)]
    pub timeout_s: u64,
}

// ── Upstream (LLM / embeddings) ──────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub(super) struct RawRateLimit {
    #[serde(default)]
    pub rpm: u32,
    #[serde(default)]
    pub tpm: u32,
}

#[derive(Deserialize, Default)]
pub(super) struct RawConcurrency {
    #[serde(default)]
    pub max_in_flight: u32,
}

#[derive(Deserialize)]
pub(super) struct RawRetry {
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_s: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_s: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RawRetry {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_backoff_s: default_initial_backoff(),
            max_backoff_s: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawLlm {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_llm_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default)]
    pub repetition_penalty: Option<f32>,
    #[serde(default)]
    pub rate_limit: RawRateLimit,
    #[serde(default)]
    pub concurrency: RawConcurrency,
    #[serde(default)]
    pub retry: RawRetry,
}

impl Default for RawLlm {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_key_env: None,
            api_base_url: default_llm_api_base_url(),
            model: default_llm_model(),
            max_tokens: None,
            temperature: 0.0,
            repetition_penalty: None,
            rate_limit: RawRateLimit::default(),
            concurrency: RawConcurrency::default(),
            retry: RawRetry::default(),
        }
    }
}

#[derive(Deserialize)]
pub(super) struct RawEmbeddings {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_embeddings_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_embeddings_model")]
    pub model: String,
    #[serde(default)]
    pub rate_limit: RawRateLimit,
    #[serde(default)]
    pub concurrency: RawConcurrency,
    #[serde(default)]
    pub retry: RawRetry,
}

impl Default for RawEmbeddings {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_key_env: None,
            api_base_url: default_embeddings_api_base_url(),
            model: default_embeddings_model(),
            rate_limit: RawRateLimit::default(),
            concurrency: RawConcurrency::default(),
            retry: RawRetry::default(),
        }
    }
}

// ── Logging ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub(super) struct RawLogging {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for RawLogging {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ── Default functions (used by serde) ────────────────────────────────────────

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8021
}
fn default_cors() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_neo4j_uri() -> String {
    "memory:".to_string()
}

fn default_max_versions() -> u32 {
    10
}

fn default_limit_nodes() -> usize {
    500
}
fn default_limit_edges() -> usize {
    1000
}
fn default_depth() -> usize {
    2
}
fn default_max_depth() -> usize {
    5
}
fn default_max_seed_nodes() -> usize {
    30
}

fn default_hooks_module() -> String {
    "sample".to_string()
}
fn default_hooks_full() -> String {
    "full_data".to_string()
}
fn default_hooks_incremental() -> String {
    "incremental_data".to_string()
}

fn default_provider() -> String {
    "openai_compatible".to_string()
}
fn default_llm_api_base_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_embeddings_api_base_url() -> String {
    "https://api.openai.com/v1/embeddings".to_string()
}
fn default_embeddings_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_initial_backoff() -> f64 {
    1.0
}
fn default_max_backoff() -> f64 {
    30.0
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
