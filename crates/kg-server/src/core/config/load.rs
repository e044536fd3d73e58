//! Configuration loading with env-var overrides.
//!
//! Reads a YAML file, resolves `*_env` secret indirection, and applies the
//! `KG_LOG_LEVEL` env override.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::core::error::AppError;

use super::raw::RawConfig;
use super::types::*;

/// Resolve a secret field: prefer the inline value, fall back to the env var
/// named by the `*_env` companion key. Empty strings count as unset.
fn resolve_secret(inline: Option<&str>, env_key: Option<&str>) -> Option<String> {
    if let Some(v) = inline {
        if !v.trim().is_empty() {
            return Some(v.to_string());
        }
    }
    if let Some(key) = env_key {
        if let Ok(v) = env::var(key) {
            if !v.trim().is_empty() {
                return Some(v);
            }
        }
    }
    None
}

/// Load config from the given path, or `config/default.yaml`, then apply
/// env-var overrides. If no path is given and the default file does not
/// exist, returns a hardcoded minimal default (in-memory stores, dummy
/// providers, sample hooks) so the service can start with zero setup.
pub fn load(config_path: Option<&str>) -> Result<Config, AppError> {
    let log_level_override = env::var("KG_LOG_LEVEL").ok();

    if let Some(path) = config_path {
        return load_from(Path::new(path), log_level_override.as_deref());
    }

    let default_path = Path::new("config/default.yaml");
    if default_path.exists() {
        load_from(default_path, log_level_override.as_deref())
    } else {
        let mut cfg = resolve(RawConfig::default())?;
        cfg.llm.provider = "dummy".to_string();
        cfg.embeddings.provider = "dummy".to_string();
        if let Some(level) = log_level_override {
            cfg.log_level = level;
        }
        Ok(cfg)
    }
}

/// Internal loader — accepts an explicit path and an optional level override.
/// Tests pass overrides directly instead of mutating env vars.
pub fn load_from(path: &Path, log_level_override: Option<&str>) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = serde_yaml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("parse error in {}: {e}", path.display())))?;

    let mut cfg = resolve(parsed)?;
    if let Some(level) = log_level_override {
        cfg.log_level = level.to_string();
    }
    Ok(cfg)
}

/// Convert the raw YAML shape into the resolved config, validating as we go.
fn resolve(parsed: RawConfig) -> Result<Config, AppError> {
    let neo4j = Neo4jConfig {
        uri: parsed.neo4j.uri,
        username: parsed.neo4j.username.unwrap_or_default(),
        password: resolve_secret(
            parsed.neo4j.password.as_deref(),
            parsed.neo4j.password_env.as_deref(),
        )
        .unwrap_or_default(),
        database: parsed.neo4j.database.unwrap_or_else(|| "neo4j".to_string()),
    };

    if !neo4j.is_memory() && neo4j.username.is_empty() {
        return Err(AppError::Config(
            "neo4j.username is required for a non-memory backend".into(),
        ));
    }

    let query = QueryConfig {
        default_limit_nodes: parsed.query.default_limit_nodes.max(1),
        default_limit_edges: parsed.query.default_limit_edges,
        default_depth: parsed.query.default_depth,
        max_depth: parsed.query.max_depth.max(1),
        max_seed_nodes: parsed.query.max_seed_nodes.max(1),
    };

    let llm = LlmConfig {
        provider: parsed.llm.provider,
        api_key: resolve_secret(
            parsed.llm.api_key.as_deref(),
            parsed.llm.api_key_env.as_deref(),
        ),
        api_base_url: parsed.llm.api_base_url,
        model: parsed.llm.model,
        max_tokens: parsed.llm.max_tokens,
        temperature: parsed.llm.temperature,
        repetition_penalty: parsed.llm.repetition_penalty,
        rate_limit: RateLimitConfig {
            rpm: parsed.llm.rate_limit.rpm,
            tpm: parsed.llm.rate_limit.tpm,
        },
        concurrency: ConcurrencyConfig {
            max_in_flight: parsed.llm.concurrency.max_in_flight,
        },
        retry: RetryConfig {
            max_retries: parsed.llm.retry.max_retries,
            initial_backoff_s: parsed.llm.retry.initial_backoff_s,
            max_backoff_s: parsed.llm.retry.max_backoff_s,
            backoff_multiplier: parsed.llm.retry.backoff_multiplier,
        },
    };

    let embeddings = EmbeddingsConfig {
        provider: parsed.embeddings.provider,
        api_key: resolve_secret(
            parsed.embeddings.api_key.as_deref(),
            parsed.embeddings.api_key_env.as_deref(),
        ),
        api_base_url: parsed.embeddings.api_base_url,
        model: parsed.embeddings.model,
        rate_limit: RateLimitConfig {
            rpm: parsed.embeddings.rate_limit.rpm,
            tpm: parsed.embeddings.rate_limit.tpm,
        },
        concurrency: ConcurrencyConfig {
            max_in_flight: parsed.embeddings.concurrency.max_in_flight,
        },
        retry: RetryConfig {
            max_retries: parsed.embeddings.retry.max_retries,
            initial_backoff_s: parsed.embeddings.retry.initial_backoff_s,
            max_backoff_s: parsed.embeddings.retry.max_backoff_s,
            backoff_multiplier: parsed.embeddings.retry.backoff_multiplier,
        },
    };

    Ok(Config {
        server: ServerConfig {
            host: parsed.server.host,
            port: parsed.server.port,
            cors_allow_origins: parsed.server.cors_allow_origins,
        },
        neo4j,
        retention: RetentionConfig {
            max_versions: parsed.retention.max_versions,
            enable_cleanup: parsed.retention.enable_cleanup,
        },
        query,
        hooks: HooksConfig {
            module: parsed.hooks.module,
            full: parsed.hooks.full,
            incremental: parsed.hooks.incremental,
            path: parsed.hooks.path.map(PathBuf::from),
        },
        task: TaskConfig {
            timeout_s: parsed.task.timeout_s,
        },
        llm,
        embeddings,
        log_level: parsed.logging.level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MINIMAL_YAML: &str = r#"
neo4j:
  uri: "memory:"
"#;

    const FULL_YAML: &str = r#"
server:
  host: 127.0.0.1
  port: 9000
  cors_allow_origins: ["https://example.com"]
neo4j:
  uri: http://localhost:7474
  username: neo4j
  password: secret
  database: kg
retention:
  max_versions: 3
  enable_cleanup: false
query:
  default_limit_nodes: 10
  default_limit_edges: 20
  default_depth: 1
hooks:
  module: chunk_file
  path: /tmp/chunks.jsonl
task:
  timeout_s: 120
llm:
  provider: openai_compatible
  api_key: sk-test
  model: gpt-4o-mini
  temperature: 0.2
  rate_limit:
    rpm: 60
    tpm: 100000
  concurrency:
    max_in_flight: 8
  retry:
    max_retries: 3
    initial_backoff_s: 0.5
    max_backoff_s: 10.0
    backoff_multiplier: 2.0
embeddings:
  provider: dummy
logging:
  level: debug
"#;

    fn write_yaml(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let f = write_yaml(MINIMAL_YAML);
        let cfg = load_from(f.path(), None).unwrap();
        assert!(cfg.neo4j.is_memory());
        assert_eq!(cfg.server.port, 8021);
        assert_eq!(cfg.retention.max_versions, 10);
        assert!(cfg.retention.enable_cleanup);
        assert_eq!(cfg.query.default_limit_nodes, 500);
        assert_eq!(cfg.hooks.module, "sample");
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn full_config_round_trips() {
        let f = write_yaml(FULL_YAML);
        let cfg = load_from(f.path(), None).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.neo4j.database, "kg");
        assert_eq!(cfg.retention.max_versions, 3);
        assert!(!cfg.retention.enable_cleanup);
        assert_eq!(cfg.hooks.module, "chunk_file");
        assert_eq!(cfg.task.timeout_s, 120);
        assert_eq!(cfg.llm.rate_limit.rpm, 60);
        assert_eq!(cfg.llm.concurrency.max_in_flight, 8);
        assert_eq!(cfg.llm.retry.max_retries, 3);
        assert_eq!(cfg.embeddings.provider, "dummy");
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn log_level_override_wins() {
        let f = write_yaml(FULL_YAML);
        let cfg = load_from(f.path(), Some("trace")).unwrap();
        assert_eq!(cfg.log_level, "trace");
    }

    #[test]
    fn missing_file_errors() {
        let result = load_from(Path::new("/nonexistent/config.yaml"), None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("config error"));
    }

    #[test]
    fn non_memory_backend_requires_username() {
        let f = write_yaml("neo4j:\n  uri: http://localhost:7474\n");
        let result = load_from(f.path(), None);
        assert!(result.is_err());
    }

    #[test]
    fn password_env_indirection_resolves() {
        std::env::set_var("KG_TEST_NEO4J_PASSWORD", "from-env");
        let f = write_yaml(
            "neo4j:\n  uri: http://localhost:7474\n  username: neo4j\n  password_env: KG_TEST_NEO4J_PASSWORD\n",
        );
        let cfg = load_from(f.path(), None).unwrap();
        assert_eq!(cfg.neo4j.password, "from-env");
        std::env::remove_var("KG_TEST_NEO4J_PASSWORD");
    }
}
