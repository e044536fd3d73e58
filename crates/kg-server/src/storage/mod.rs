//! Durable state — graph metadata, task history, and versioned graph data.
//!
//! Two stores share one backend:
//! - [`MetadataStore`] — the `KGState` singleton (single-writer CAS) and
//!   `KGTask` records;
//! - [`GraphStore`] — versioned entity/relationship storage and queries.
//!
//! Each is an enum over the Neo4j implementation and an in-memory twin with
//! identical semantics (tests, `memory:` dev mode). Backend selection comes
//! from `neo4j.uri` at wiring time via [`build`].

pub mod cypher;
pub mod graph_store;
pub mod memory;
pub mod state_store;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Map;
use thiserror::Error;

use crate::core::config::Neo4jConfig;
use crate::kg::KnowledgeGraph;

/// The only graph this instance serves.
pub const GRAPH_NAME_DEFAULT: &str = "default";

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("graph database error: {0}")]
    Database(String),

    /// A commit arrived for a task that is no longer the current one.
    #[error("stale commit for task {0}")]
    StaleTask(String),
}

/// Outcome of the admission CAS.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Another task holds the writer slot; carries the observed state.
    #[error("a task is already running")]
    Conflict {
        state: KgState,
        task: Option<TaskInfo>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ── State & task records ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KgStatus {
    Idle,
    Building,
    Updating,
    Ready,
    Failed,
}

impl KgStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KgStatus::Idle => "IDLE",
            KgStatus::Building => "BUILDING",
            KgStatus::Updating => "UPDATING",
            KgStatus::Ready => "READY",
            KgStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(KgStatus::Idle),
            "BUILDING" => Some(KgStatus::Building),
            "UPDATING" => Some(KgStatus::Updating),
            "READY" => Some(KgStatus::Ready),
            "FAILED" => Some(KgStatus::Failed),
            _ => None,
        }
    }

    /// True when a new trigger may take the writer slot.
    pub fn is_admitting(&self) -> bool {
        !matches!(self, KgStatus::Building | KgStatus::Updating)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    FullBuild,
    IncrementalUpdate,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::FullBuild => "full_build",
            TaskType::IncrementalUpdate => "incremental_update",
        }
    }

    /// The non-admitting status this task type runs under.
    pub fn running_status(&self) -> KgStatus {
        match self {
            TaskType::FullBuild => KgStatus::Building,
            TaskType::IncrementalUpdate => KgStatus::Updating,
        }
    }
}

/// The `KGState` singleton row.
#[derive(Debug, Clone, Serialize)]
pub struct KgState {
    pub status: KgStatus,
    pub latest_ready_version: Option<String>,
    pub current_task_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl KgState {
    pub fn initial(now: DateTime<Utc>) -> Self {
        Self {
            status: KgStatus::Idle,
            latest_ready_version: None,
            current_task_id: None,
            updated_at: now,
        }
    }
}

/// One `KGTask` record; immutable once `finished_at` is set.
#[derive(Debug, Clone, Serialize)]
pub struct TaskInfo {
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub version: String,
    pub base_version: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub progress: Option<u8>,
    pub message: Option<String>,
    pub error: Option<String>,
}

// ── Query results ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
pub struct GraphStats {
    pub entity_count: u64,
    pub relation_count: u64,
    pub node_type_count: u64,
}

/// Limits for one `/kg/query` evaluation, already defaulted and clamped.
#[derive(Debug, Clone, Copy)]
pub struct QueryLimits {
    pub limit_nodes: usize,
    pub limit_edges: usize,
    pub depth: usize,
    pub max_seed_nodes: usize,
    pub include_properties: bool,
}

/// Node as surfaced to API consumers: `id` is `<label>:<name>`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeView {
    pub id: String,
    pub types: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, serde_json::Value>>,
}

/// Edge as surfaced to API consumers: `id` is `<source>-><predicate>-><target>`.
#[derive(Debug, Clone, Serialize)]
pub struct EdgeView {
    pub id: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub source: String,
    pub target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Map<String, serde_json::Value>>,
}

/// A bounded slice of one graph version.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphSlice {
    pub nodes: Vec<NodeView>,
    pub edges: Vec<EdgeView>,
    pub truncated: bool,
}

// ── Backend dispatch ──────────────────────────────────────────────────────────

/// Metadata backend: global state CAS + task records.
#[derive(Debug, Clone)]
pub enum MetadataStore {
    Neo4j(state_store::Neo4jMetadataStore),
    Memory(memory::MemoryMetadataStore),
}

impl MetadataStore {
    /// Create uniqueness constraints; idempotent.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        match self {
            MetadataStore::Neo4j(s) => s.ensure_schema().await,
            MetadataStore::Memory(_) => Ok(()),
        }
    }

    /// Sweep a crashed `BUILDING`/`UPDATING` state to `FAILED`; idempotent.
    pub async fn recover_on_startup(&self) -> Result<(), StoreError> {
        match self {
            MetadataStore::Neo4j(s) => s.recover_on_startup().await,
            MetadataStore::Memory(s) => s.recover_on_startup(),
        }
    }

    /// Current state plus the task worth showing: the running one, or the
    /// most recent failure when the state is `FAILED` with no current task.
    pub async fn read(&self) -> Result<(KgState, Option<TaskInfo>), StoreError> {
        match self {
            MetadataStore::Neo4j(s) => s.read().await,
            MetadataStore::Memory(s) => s.read(),
        }
    }

    /// Admission CAS: promote to `BUILDING`/`UPDATING` iff no task is
    /// running, inserting the task record in the same transaction.
    pub async fn try_acquire(
        &self,
        task_type: TaskType,
        version: &str,
        base_version: Option<&str>,
    ) -> Result<TaskInfo, AcquireError> {
        match self {
            MetadataStore::Neo4j(s) => s.try_acquire(task_type, version, base_version).await,
            MetadataStore::Memory(s) => s.try_acquire(task_type, version, base_version),
        }
    }

    /// Best-effort progress update; failures are the caller's to log.
    pub async fn update_progress(
        &self,
        task_id: &str,
        progress: u8,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        match self {
            MetadataStore::Neo4j(s) => s.update_progress(task_id, progress, message).await,
            MetadataStore::Memory(s) => s.update_progress(task_id, progress, message),
        }
    }

    /// Publish `version` and release the writer slot. Errors with
    /// [`StoreError::StaleTask`] when `task_id` no longer holds the slot.
    pub async fn commit_success(&self, task_id: &str, version: &str) -> Result<(), StoreError> {
        match self {
            MetadataStore::Neo4j(s) => s.commit_success(task_id, version).await,
            MetadataStore::Memory(s) => s.commit_success(task_id, version),
        }
    }

    /// Record failure and release the writer slot; `latest_ready_version`
    /// is untouched.
    pub async fn commit_failure(&self, task_id: &str, error: &str) -> Result<(), StoreError> {
        match self {
            MetadataStore::Neo4j(s) => s.commit_failure(task_id, error).await,
            MetadataStore::Memory(s) => s.commit_failure(task_id, error),
        }
    }

    /// Versions of successfully finished tasks, for the retention sweeper.
    pub async fn ready_versions(&self) -> Result<Vec<String>, StoreError> {
        match self {
            MetadataStore::Neo4j(s) => s.ready_versions().await,
            MetadataStore::Memory(s) => s.ready_versions(),
        }
    }
}

/// Versioned graph backend.
#[derive(Debug, Clone)]
pub enum GraphStore {
    Neo4j(graph_store::Neo4jGraphStore),
    Memory(memory::MemoryGraphStore),
}

impl GraphStore {
    /// Persist a complete graph under `version` (idempotent merge).
    pub async fn write_graph(&self, version: &str, graph: &KnowledgeGraph) -> Result<(), StoreError> {
        match self {
            GraphStore::Neo4j(s) => s.write_graph(version, graph).await,
            GraphStore::Memory(s) => s.write_graph(version, graph),
        }
    }

    /// Project the full version back into the extractor's graph type.
    pub async fn load_graph(&self, version: &str) -> Result<KnowledgeGraph, StoreError> {
        match self {
            GraphStore::Neo4j(s) => s.load_graph(version).await,
            GraphStore::Memory(s) => s.load_graph(version),
        }
    }

    /// Detach-delete every node (and thereby edge) tagged with `version`.
    pub async fn delete_version(&self, version: &str) -> Result<(), StoreError> {
        match self {
            GraphStore::Neo4j(s) => s.delete_version(version).await,
            GraphStore::Memory(s) => s.delete_version(version),
        }
    }

    pub async fn entity_types(&self, version: &str) -> Result<Vec<String>, StoreError> {
        match self {
            GraphStore::Neo4j(s) => s.entity_types(version).await,
            GraphStore::Memory(s) => s.entity_types(version),
        }
    }

    pub async fn relation_types(&self, version: &str) -> Result<Vec<String>, StoreError> {
        match self {
            GraphStore::Neo4j(s) => s.relation_types(version).await,
            GraphStore::Memory(s) => s.relation_types(version),
        }
    }

    pub async fn stats(&self, version: &str) -> Result<GraphStats, StoreError> {
        match self {
            GraphStore::Neo4j(s) => s.stats(version).await,
            GraphStore::Memory(s) => s.stats(version),
        }
    }

    /// Keyword subgraph (when `q` is non-empty) or a bounded full-graph
    /// slice. Seed matching is case-insensitive substring on `name`.
    pub async fn query(
        &self,
        version: &str,
        q: Option<&str>,
        limits: &QueryLimits,
    ) -> Result<GraphSlice, StoreError> {
        match self {
            GraphStore::Neo4j(s) => s.query(version, q, limits).await,
            GraphStore::Memory(s) => s.query(version, q, limits),
        }
    }
}

/// Build both stores from config; `memory:` URIs select the in-memory
/// backend, everything else the Neo4j HTTP endpoint.
pub fn build(cfg: &Neo4jConfig) -> Result<(MetadataStore, GraphStore), StoreError> {
    if cfg.is_memory() {
        let shared = memory::MemoryBackend::shared();
        Ok((
            MetadataStore::Memory(memory::MemoryMetadataStore::new(shared.clone())),
            GraphStore::Memory(memory::MemoryGraphStore::new(shared)),
        ))
    } else {
        let client = Arc::new(cypher::CypherClient::from_config(cfg)?);
        Ok((
            MetadataStore::Neo4j(state_store::Neo4jMetadataStore::new(client.clone())),
            GraphStore::Neo4j(graph_store::Neo4jGraphStore::new(client)),
        ))
    }
}
