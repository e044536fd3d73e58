//! Cypher transport — Neo4j HTTP transactional API over reqwest.
//!
//! Each [`CypherClient::run`] call is one `tx/commit` round-trip, i.e. one
//! transaction; multi-statement transactions go through
//! [`CypherClient::run_many`]. Wire types are private — callers see
//! [`QueryResult`] rows of plain JSON values (nodes come back as their
//! property maps in row format).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::core::config::Neo4jConfig;
use crate::storage::StoreError;

const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Debug)]
pub struct CypherClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl CypherClient {
    pub fn from_config(cfg: &Neo4jConfig) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| StoreError::Database(format!("failed to build HTTP client: {e}")))?;

        let base = cfg.uri.trim_end_matches('/');
        let endpoint = format!("{base}/db/{}/tx/commit", cfg.database);

        Ok(Self {
            http,
            endpoint,
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        })
    }

    /// Execute one statement in its own transaction.
    pub async fn run(&self, statement: &str, parameters: Value) -> Result<QueryResult, StoreError> {
        let mut results = self
            .run_many(vec![(statement.to_string(), parameters)])
            .await?;
        Ok(results.pop().unwrap_or_default())
    }

    /// Execute several statements in one transaction; results come back in
    /// statement order.
    pub async fn run_many(
        &self,
        statements: Vec<(String, Value)>,
    ) -> Result<Vec<QueryResult>, StoreError> {
        let body = TxRequest {
            statements: statements
                .into_iter()
                .map(|(statement, parameters)| Statement { statement, parameters })
                .collect(),
        };

        trace!(endpoint = %self.endpoint, statements = body.statements.len(), "cypher tx/commit");

        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await
            .map_err(|e| StoreError::Database(format!("neo4j request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(StoreError::Database(format!("neo4j HTTP {status}: {text}")));
        }

        let parsed: TxResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Database(format!("neo4j response parse failed: {e}")))?;

        if let Some(err) = parsed.errors.first() {
            return Err(StoreError::Database(format!("{}: {}", err.code, err.message)));
        }

        Ok(parsed
            .results
            .into_iter()
            .map(|r| QueryResult {
                columns: r.columns,
                rows: r.data.into_iter().map(|d| d.row).collect(),
            })
            .collect())
    }
}

/// One statement's rows, in Neo4j "row" format.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl QueryResult {
    /// Value at (`row`, `column-name`), if present.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row)?.get(idx)
    }
}

// ── Row value helpers ─────────────────────────────────────────────────────────

/// Non-empty string at a JSON value; `null` and `""` are `None`.
pub fn opt_string(v: Option<&Value>) -> Option<String> {
    v.and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn as_u64(v: Option<&Value>) -> u64 {
    v.and_then(Value::as_u64).unwrap_or(0)
}

// ── Private wire types ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct TxRequest {
    statements: Vec<Statement>,
}

#[derive(Debug, Serialize)]
struct Statement {
    statement: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<RowData>,
}

#[derive(Debug, Deserialize)]
struct RowData {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_result_get_resolves_columns() {
        let r = QueryResult {
            columns: vec!["a".into(), "b".into()],
            rows: vec![vec![json!(1), json!("x")], vec![json!(2), json!("y")]],
        };
        assert_eq!(r.get(0, "a"), Some(&json!(1)));
        assert_eq!(r.get(1, "b"), Some(&json!("y")));
        assert_eq!(r.get(0, "missing"), None);
        assert_eq!(r.get(9, "a"), None);
    }

    #[test]
    fn opt_string_filters_null_and_empty() {
        assert_eq!(opt_string(Some(&json!("v"))), Some("v".to_string()));
        assert_eq!(opt_string(Some(&json!(""))), None);
        assert_eq!(opt_string(Some(&Value::Null)), None);
        assert_eq!(opt_string(None), None);
    }

    #[test]
    fn endpoint_includes_database() {
        let cfg = Neo4jConfig {
            uri: "http://localhost:7474/".to_string(),
            username: "neo4j".to_string(),
            password: "pw".to_string(),
            database: "kg".to_string(),
        };
        let client = CypherClient::from_config(&cfg).unwrap();
        assert_eq!(client.endpoint, "http://localhost:7474/db/kg/tx/commit");
    }
}
