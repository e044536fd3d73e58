//! In-memory store twins — same semantics as the Neo4j backend, no network.
//!
//! Used by the test suite and by the `memory:` URI for keyless local runs.
//! Both stores share one [`MemoryBackend`] so metadata and graph data stay
//! consistent the way they would against a single database.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::kg::{EntityRef, KnowledgeGraph, Relationship, FALLBACK_PREDICATE};
use crate::storage::graph_store::SliceAccumulator;
use crate::storage::{
    AcquireError, GraphSlice, GraphStats, KgState, KgStatus, QueryLimits, StoreError, TaskInfo,
    TaskType,
};
use crate::version::cmp_versions;

#[derive(Debug)]
struct MetaState {
    state: KgState,
    tasks: HashMap<String, TaskInfo>,
}

#[derive(Debug)]
pub struct MemoryBackend {
    meta: Mutex<MetaState>,
    graphs: Mutex<HashMap<String, KnowledgeGraph>>,
}

impl MemoryBackend {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            meta: Mutex::new(MetaState {
                state: KgState::initial(Utc::now()),
                tasks: HashMap::new(),
            }),
            graphs: Mutex::new(HashMap::new()),
        })
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Metadata ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryMetadataStore {
    backend: Arc<MemoryBackend>,
}

impl MemoryMetadataStore {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }

    pub fn recover_on_startup(&self) -> Result<(), StoreError> {
        let mut meta = lock(&self.backend.meta);
        if meta.state.status.is_admitting() {
            return Ok(());
        }
        let now = Utc::now();
        if let Some(task_id) = meta.state.current_task_id.take() {
            if let Some(task) = meta.tasks.get_mut(&task_id) {
                task.error.get_or_insert_with(|| "server restarted".to_string());
                task.finished_at = Some(now);
            }
        }
        meta.state.status = KgStatus::Failed;
        meta.state.updated_at = now;
        Ok(())
    }

    pub fn read(&self) -> Result<(KgState, Option<TaskInfo>), StoreError> {
        let meta = lock(&self.backend.meta);
        let state = meta.state.clone();
        let mut task = state
            .current_task_id
            .as_ref()
            .and_then(|id| meta.tasks.get(id))
            .cloned();

        if state.status == KgStatus::Failed && task.is_none() {
            task = meta
                .tasks
                .values()
                .filter(|t| t.finished_at.is_some() && t.error.is_some())
                .max_by_key(|t| t.finished_at)
                .cloned();
        }
        Ok((state, task))
    }

    pub fn try_acquire(
        &self,
        task_type: TaskType,
        version: &str,
        base_version: Option<&str>,
    ) -> Result<TaskInfo, AcquireError> {
        let mut meta = lock(&self.backend.meta);
        if !meta.state.status.is_admitting() {
            let running = meta
                .state
                .current_task_id
                .as_ref()
                .and_then(|id| meta.tasks.get(id))
                .cloned();
            return Err(AcquireError::Conflict {
                state: meta.state.clone(),
                task: running,
            });
        }

        let now = Utc::now();
        let task = TaskInfo {
            task_id: version.to_string(),
            task_type,
            version: version.to_string(),
            base_version: base_version.map(str::to_string),
            started_at: now,
            finished_at: None,
            progress: Some(0),
            message: None,
            error: None,
        };
        meta.tasks.insert(task.task_id.clone(), task.clone());
        meta.state.status = task_type.running_status();
        meta.state.current_task_id = Some(task.task_id.clone());
        meta.state.updated_at = now;
        Ok(task)
    }

    pub fn update_progress(
        &self,
        task_id: &str,
        progress: u8,
        message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut meta = lock(&self.backend.meta);
        if let Some(task) = meta.tasks.get_mut(task_id) {
            task.progress = Some(progress.min(100));
            if let Some(m) = message {
                task.message = Some(m.to_string());
            }
        }
        Ok(())
    }

    pub fn commit_success(&self, task_id: &str, version: &str) -> Result<(), StoreError> {
        let mut meta = lock(&self.backend.meta);
        if meta.state.current_task_id.as_deref() != Some(task_id) {
            return Err(StoreError::StaleTask(task_id.to_string()));
        }
        if let Some(latest) = &meta.state.latest_ready_version {
            if cmp_versions(latest, version) != std::cmp::Ordering::Less {
                return Err(StoreError::StaleTask(task_id.to_string()));
            }
        }

        let now = Utc::now();
        if let Some(task) = meta.tasks.get_mut(task_id) {
            task.finished_at = Some(now);
            task.progress = Some(100);
            task.error = None;
        }
        meta.state.status = KgStatus::Ready;
        meta.state.latest_ready_version = Some(version.to_string());
        meta.state.current_task_id = None;
        meta.state.updated_at = now;
        Ok(())
    }

    pub fn commit_failure(&self, task_id: &str, error: &str) -> Result<(), StoreError> {
        let mut meta = lock(&self.backend.meta);
        if meta.state.current_task_id.as_deref() != Some(task_id) {
            return Err(StoreError::StaleTask(task_id.to_string()));
        }

        let now = Utc::now();
        if let Some(task) = meta.tasks.get_mut(task_id) {
            task.finished_at = Some(now);
            task.error = Some(error.to_string());
        }
        meta.state.status = KgStatus::Failed;
        meta.state.current_task_id = None;
        meta.state.updated_at = now;
        Ok(())
    }

    pub fn ready_versions(&self) -> Result<Vec<String>, StoreError> {
        let meta = lock(&self.backend.meta);
        Ok(meta
            .tasks
            .values()
            .filter(|t| t.finished_at.is_some() && t.error.is_none())
            .map(|t| t.version.clone())
            .collect())
    }
}

// ── Graph ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemoryGraphStore {
    backend: Arc<MemoryBackend>,
}

impl MemoryGraphStore {
    pub fn new(backend: Arc<MemoryBackend>) -> Self {
        Self { backend }
    }

    pub fn write_graph(&self, version: &str, graph: &KnowledgeGraph) -> Result<(), StoreError> {
        let mut graphs = lock(&self.backend.graphs);
        let stored = graphs.entry(version.to_string()).or_default();
        for e in &graph.entities {
            stored.upsert_entity(e.clone());
        }
        for r in &graph.relationships {
            stored.upsert_relationship(r.clone());
        }
        Ok(())
    }

    pub fn load_graph(&self, version: &str) -> Result<KnowledgeGraph, StoreError> {
        Ok(lock(&self.backend.graphs)
            .get(version)
            .cloned()
            .unwrap_or_default())
    }

    pub fn delete_version(&self, version: &str) -> Result<(), StoreError> {
        lock(&self.backend.graphs).remove(version);
        Ok(())
    }

    /// Versions currently holding any graph data — test-support inspection.
    pub fn stored_versions(&self) -> Vec<String> {
        let mut versions: Vec<String> = lock(&self.backend.graphs).keys().cloned().collect();
        versions.sort();
        versions
    }

    pub fn entity_types(&self, version: &str) -> Result<Vec<String>, StoreError> {
        let graphs = lock(&self.backend.graphs);
        let types: BTreeSet<String> = graphs
            .get(version)
            .map(|g| g.entities.iter().map(|e| e.label.clone()).collect())
            .unwrap_or_default();
        Ok(types.into_iter().collect())
    }

    pub fn relation_types(&self, version: &str) -> Result<Vec<String>, StoreError> {
        let graphs = lock(&self.backend.graphs);
        let types: BTreeSet<String> = graphs
            .get(version)
            .map(|g| {
                g.relationships
                    .iter()
                    .map(|r| effective_predicate(r).to_string())
                    .collect()
            })
            .unwrap_or_default();
        Ok(types.into_iter().collect())
    }

    pub fn stats(&self, version: &str) -> Result<GraphStats, StoreError> {
        let graphs = lock(&self.backend.graphs);
        let Some(g) = graphs.get(version) else {
            return Ok(GraphStats { entity_count: 0, relation_count: 0, node_type_count: 0 });
        };
        let labels: HashSet<&str> = g.entities.iter().map(|e| e.label.as_str()).collect();
        Ok(GraphStats {
            entity_count: g.entities.len() as u64,
            relation_count: g.relationships.len() as u64,
            node_type_count: labels.len() as u64,
        })
    }

    /// Same contract as the Neo4j query: case-insensitive substring seeds,
    /// BFS expansion up to `depth` hops, early stop at the element limits.
    pub fn query(
        &self,
        version: &str,
        q: Option<&str>,
        limits: &QueryLimits,
    ) -> Result<GraphSlice, StoreError> {
        let graphs = lock(&self.backend.graphs);
        let Some(g) = graphs.get(version) else {
            return Ok(GraphSlice::default());
        };

        let q = q.map(str::trim).filter(|s| !s.is_empty());
        let mut acc = SliceAccumulator::new(limits.include_properties);
        let node_props: HashMap<EntityRef, Map<String, Value>> = g
            .entities
            .iter()
            .map(|e| {
                (
                    e.key(),
                    obj(json!({
                        "kg_version": version,
                        "entity_label": e.label,
                        "name": e.name,
                        "embeddings": e.embeddings,
                    })),
                )
            })
            .collect();

        match q {
            Some(q) => {
                let needle = q.to_lowercase();
                let seeds: Vec<EntityRef> = g
                    .entities
                    .iter()
                    .filter(|e| e.name.to_lowercase().contains(&needle))
                    .take(limits.max_seed_nodes)
                    .map(|e| e.key())
                    .collect();
                if seeds.is_empty() {
                    return Ok(GraphSlice::default());
                }
                for seed in &seeds {
                    if let Some(props) = node_props.get(seed) {
                        acc.add_node(props);
                    }
                }

                let mut visited: HashSet<EntityRef> = seeds.iter().cloned().collect();
                let mut frontier = seeds;
                'expansion: for _ in 0..limits.depth {
                    let mut next = Vec::new();
                    for rel in &g.relationships {
                        let touches_src = frontier.contains(&rel.source);
                        let touches_tgt = frontier.contains(&rel.target);
                        if !touches_src && !touches_tgt {
                            continue;
                        }
                        let (Some(sp), Some(tp)) =
                            (node_props.get(&rel.source), node_props.get(&rel.target))
                        else {
                            continue;
                        };
                        acc.add_edge(sp, &rel_props(version, rel), tp);
                        for endpoint in [&rel.source, &rel.target] {
                            if visited.insert(endpoint.clone()) {
                                next.push(endpoint.clone());
                            }
                        }
                        if acc.nodes.len() > limits.limit_nodes
                            || acc.edges.len() > limits.limit_edges
                        {
                            break 'expansion;
                        }
                    }
                    if next.is_empty() {
                        break;
                    }
                    frontier = next;
                }
            }
            None => {
                if limits.limit_edges > 0 {
                    for rel in g.relationships.iter().take(limits.limit_edges + 1) {
                        let (Some(sp), Some(tp)) =
                            (node_props.get(&rel.source), node_props.get(&rel.target))
                        else {
                            continue;
                        };
                        acc.add_edge(sp, &rel_props(version, rel), tp);
                    }
                }
                if acc.nodes.is_empty() {
                    for e in g.entities.iter().take(limits.limit_nodes + 1) {
                        if let Some(props) = node_props.get(&e.key()) {
                            acc.add_node(props);
                        }
                    }
                }
            }
        }

        Ok(acc.finish(limits.limit_nodes, limits.limit_edges))
    }
}

fn effective_predicate(rel: &Relationship) -> &str {
    if rel.predicate.is_empty() {
        FALLBACK_PREDICATE
    } else {
        &rel.predicate
    }
}

fn rel_props(version: &str, rel: &Relationship) -> Map<String, Value> {
    obj(json!({
        "kg_version": version,
        "predicate": effective_predicate(rel),
        "atomic_facts": rel.atomic_facts,
        "t_obs": rel.t_obs,
        "t_start": rel.t_start,
        "t_end": rel.t_end,
        "embeddings": rel.embeddings,
    }))
}

fn obj(v: Value) -> Map<String, Value> {
    match v {
        Value::Object(m) => m,
        _ => Map::new(),
    }
}
