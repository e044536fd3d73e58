//! Neo4j-backed metadata store — the `KGState` singleton and `KGTask` rows.
//!
//! Every mutating operation is a single Cypher statement in its own
//! transaction, so the admission CAS and the commit guards ride on the
//! database's write serializability and survive process restarts.
//! Timestamps are RFC 3339 strings generated here, not `datetime()`, so the
//! row format stays backend-neutral.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::info;

use crate::storage::cypher::{opt_string, CypherClient};
use crate::storage::{AcquireError, KgState, KgStatus, StoreError, TaskInfo, TaskType, GRAPH_NAME_DEFAULT};

#[derive(Debug, Clone)]
pub struct Neo4jMetadataStore {
    client: Arc<CypherClient>,
    graph_name: String,
}

impl Neo4jMetadataStore {
    pub fn new(client: Arc<CypherClient>) -> Self {
        Self {
            client,
            graph_name: GRAPH_NAME_DEFAULT.to_string(),
        }
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        let statements = [
            "CREATE CONSTRAINT kgstate_graph_name IF NOT EXISTS FOR (s:KGState) REQUIRE s.graph_name IS UNIQUE",
            "CREATE CONSTRAINT kgtask_task_id IF NOT EXISTS FOR (t:KGTask) REQUIRE t.task_id IS UNIQUE",
            "CREATE CONSTRAINT entity_unique IF NOT EXISTS FOR (e:Entity) REQUIRE (e.kg_version, e.entity_label, e.name) IS UNIQUE",
        ];
        for stmt in statements {
            self.client.run(stmt, json!({})).await?;
        }
        Ok(())
    }

    pub async fn recover_on_startup(&self) -> Result<(), StoreError> {
        let query = r#"
MERGE (s:KGState {graph_name: $graph_name})
ON CREATE SET
  s.status = 'IDLE',
  s.latest_ready_version = null,
  s.current_task_id = null,
  s.updated_at = $now
WITH s
OPTIONAL MATCH (t:KGTask {task_id: s.current_task_id})
WITH s, t
WHERE s.status IN ['BUILDING','UPDATING']
SET s.status = 'FAILED', s.updated_at = $now, s.current_task_id = null
FOREACH (_ IN CASE WHEN t IS NULL THEN [] ELSE [1] END |
  SET t.error = coalesce(t.error, 'server restarted'), t.finished_at = $now
)
RETURN s.status AS status
"#;
        let result = self
            .client
            .run(query, json!({ "graph_name": self.graph_name, "now": now_rfc3339() }))
            .await?;
        if !result.rows.is_empty() {
            info!("swept interrupted task to FAILED on startup");
        }
        Ok(())
    }

    pub async fn read(&self) -> Result<(KgState, Option<TaskInfo>), StoreError> {
        let query = r#"
MERGE (s:KGState {graph_name: $graph_name})
ON CREATE SET
  s.status = 'IDLE',
  s.latest_ready_version = null,
  s.current_task_id = null,
  s.updated_at = $now
WITH s
OPTIONAL MATCH (t:KGTask {task_id: s.current_task_id})
RETURN s AS state, t AS task
"#;
        let result = self
            .client
            .run(query, json!({ "graph_name": self.graph_name, "now": now_rfc3339() }))
            .await?;

        let state = state_from_value(result.get(0, "state"))?;
        let mut task = result.get(0, "task").and_then(task_from_value);

        // After crash recovery there is no current task; surface the most
        // recent failure so /kg/status still shows the cause.
        if state.status == KgStatus::Failed && task.is_none() {
            let failed = self
                .client
                .run(
                    r#"
MATCH (t:KGTask)
WHERE t.finished_at IS NOT NULL AND t.error IS NOT NULL
RETURN t
ORDER BY t.finished_at DESC
LIMIT 1
"#,
                    json!({}),
                )
                .await?;
            task = failed.get(0, "t").and_then(task_from_value);
        }

        Ok((state, task))
    }

    pub async fn try_acquire(
        &self,
        task_type: TaskType,
        version: &str,
        base_version: Option<&str>,
    ) -> Result<TaskInfo, AcquireError> {
        let query = r#"
MERGE (s:KGState {graph_name: $graph_name})
ON CREATE SET
  s.status = 'IDLE',
  s.latest_ready_version = null,
  s.current_task_id = null,
  s.updated_at = $now
WITH s
OPTIONAL MATCH (running:KGTask {task_id: s.current_task_id})
WITH s, running
CALL (s, running) {
  WITH s, running
  WHERE s.status IN ['BUILDING','UPDATING']
  RETURN true AS conflict, s AS state, running AS task
  UNION
  WITH s, running
  WHERE NOT s.status IN ['BUILDING','UPDATING']
  MERGE (t:KGTask {task_id: $task_id})
  ON CREATE SET
    t.type = $task_type,
    t.version = $version,
    t.base_version = $base_version,
    t.started_at = $now,
    t.finished_at = null,
    t.progress = 0,
    t.message = null,
    t.error = null
  SET s.status = $target_status, s.current_task_id = $task_id, s.updated_at = $now
  RETURN false AS conflict, s AS state, t AS task
}
RETURN conflict, state, task
"#;
        let result = self
            .client
            .run(
                query,
                json!({
                    "graph_name": self.graph_name,
                    "task_id": version,
                    "task_type": task_type.as_str(),
                    "version": version,
                    "base_version": base_version,
                    "target_status": task_type.running_status().as_str(),
                    "now": now_rfc3339(),
                }),
            )
            .await
            .map_err(AcquireError::Store)?;

        let conflict = result
            .get(0, "conflict")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let state = state_from_value(result.get(0, "state")).map_err(AcquireError::Store)?;
        let task = result.get(0, "task").and_then(task_from_value);

        if conflict {
            return Err(AcquireError::Conflict { state, task });
        }
        task.ok_or_else(|| {
            AcquireError::Store(StoreError::Database("acquire returned no task".into()))
        })
    }

    pub async fn update_progress(
        &self,
        task_id: &str,
        progress: u8,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let query = r#"
MATCH (t:KGTask {task_id: $task_id})
SET t.progress = $progress
FOREACH (_ IN CASE WHEN $message IS NULL THEN [] ELSE [1] END | SET t.message = $message)
RETURN count(t) AS n
"#;
        self.client
            .run(
                query,
                json!({ "task_id": task_id, "progress": progress, "message": message }),
            )
            .await?;
        Ok(())
    }

    pub async fn commit_success(&self, task_id: &str, version: &str) -> Result<(), StoreError> {
        // The guards make a stale or version-lowering commit match zero rows:
        // only the current task may commit, and the published version only
        // ever advances (versions are equal-length decimal strings, so the
        // string comparison is numeric).
        let query = r#"
MATCH (s:KGState {graph_name: $graph_name})
WHERE s.current_task_id = $task_id
  AND (s.latest_ready_version IS NULL OR s.latest_ready_version < $version)
MATCH (t:KGTask {task_id: $task_id})
SET
  s.status = 'READY',
  s.latest_ready_version = $version,
  s.current_task_id = null,
  s.updated_at = $now,
  t.finished_at = $now,
  t.progress = 100,
  t.error = null
RETURN count(s) AS n
"#;
        let result = self
            .client
            .run(
                query,
                json!({
                    "graph_name": self.graph_name,
                    "task_id": task_id,
                    "version": version,
                    "now": now_rfc3339(),
                }),
            )
            .await?;

        if result.get(0, "n").and_then(Value::as_u64).unwrap_or(0) == 0 {
            return Err(StoreError::StaleTask(task_id.to_string()));
        }
        Ok(())
    }

    pub async fn commit_failure(&self, task_id: &str, error: &str) -> Result<(), StoreError> {
        let query = r#"
MATCH (s:KGState {graph_name: $graph_name})
WHERE s.current_task_id = $task_id
MATCH (t:KGTask {task_id: $task_id})
SET
  s.status = 'FAILED',
  s.current_task_id = null,
  s.updated_at = $now,
  t.finished_at = $now,
  t.error = $error
RETURN count(s) AS n
"#;
        let result = self
            .client
            .run(
                query,
                json!({
                    "graph_name": self.graph_name,
                    "task_id": task_id,
                    "error": error,
                    "now": now_rfc3339(),
                }),
            )
            .await?;

        if result.get(0, "n").and_then(Value::as_u64).unwrap_or(0) == 0 {
            return Err(StoreError::StaleTask(task_id.to_string()));
        }
        Ok(())
    }

    pub async fn ready_versions(&self) -> Result<Vec<String>, StoreError> {
        let query = r#"
MATCH (t:KGTask)
WHERE t.finished_at IS NOT NULL AND (t.error IS NULL OR t.error = '')
RETURN DISTINCT t.version AS version
"#;
        let result = self.client.run(query, json!({})).await?;
        Ok((0..result.rows.len())
            .filter_map(|i| opt_string(result.get(i, "version")))
            .collect())
    }
}

// ── Row parsing ───────────────────────────────────────────────────────────────

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

fn parse_datetime(v: Option<&Value>) -> Option<DateTime<Utc>> {
    v.and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn state_from_value(v: Option<&Value>) -> Result<KgState, StoreError> {
    let obj = v
        .and_then(Value::as_object)
        .ok_or_else(|| StoreError::Database("KGState row missing".into()))?;

    let status_str = obj.get("status").and_then(Value::as_str).unwrap_or("IDLE");
    let status = KgStatus::parse(status_str)
        .ok_or_else(|| StoreError::Database(format!("unknown status: {status_str}")))?;

    Ok(KgState {
        status,
        latest_ready_version: opt_string(obj.get("latest_ready_version")),
        current_task_id: opt_string(obj.get("current_task_id")),
        updated_at: parse_datetime(obj.get("updated_at")).unwrap_or(DateTime::UNIX_EPOCH),
    })
}

fn task_from_value(v: &Value) -> Option<TaskInfo> {
    let obj = v.as_object()?;
    let task_type = match obj.get("type").and_then(Value::as_str)? {
        "full_build" => TaskType::FullBuild,
        "incremental_update" => TaskType::IncrementalUpdate,
        _ => return None,
    };
    Some(TaskInfo {
        task_id: obj.get("task_id").and_then(Value::as_str)?.to_string(),
        task_type,
        version: obj.get("version").and_then(Value::as_str)?.to_string(),
        base_version: opt_string(obj.get("base_version")),
        started_at: parse_datetime(obj.get("started_at")).unwrap_or(DateTime::UNIX_EPOCH),
        finished_at: parse_datetime(obj.get("finished_at")),
        progress: obj
            .get("progress")
            .and_then(Value::as_u64)
            .map(|p| p.min(100) as u8),
        message: opt_string(obj.get("message")),
        error: opt_string(obj.get("error")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn state_parses_from_row_props() {
        let v = json!({
            "status": "READY",
            "latest_ready_version": "1700000000001",
            "current_task_id": null,
            "updated_at": "2024-01-01T00:00:00+00:00",
        });
        let state = state_from_value(Some(&v)).unwrap();
        assert_eq!(state.status, KgStatus::Ready);
        assert_eq!(state.latest_ready_version.as_deref(), Some("1700000000001"));
        assert!(state.current_task_id.is_none());
    }

    #[test]
    fn unknown_status_is_an_error() {
        let v = json!({ "status": "WAT" });
        assert!(state_from_value(Some(&v)).is_err());
    }

    #[test]
    fn task_parses_with_optional_fields_absent() {
        let v = json!({
            "task_id": "1700000000001",
            "type": "full_build",
            "version": "1700000000001",
            "started_at": "2024-01-01T00:00:00+00:00",
        });
        let task = task_from_value(&v).unwrap();
        assert_eq!(task.task_type, TaskType::FullBuild);
        assert!(task.finished_at.is_none());
        assert!(task.error.is_none());
    }
}
