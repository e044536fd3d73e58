//! The build orchestrator — trigger admission, pipeline execution, retention.
//!
//! At most one pipeline runs at a time, enforced by the metadata store's
//! admission CAS rather than any in-process lock, so the guarantee holds
//! across restarts (and across accidentally doubled instances). A trigger
//! returns as soon as the CAS lands; the pipeline itself runs in a spawned
//! task that ends in exactly one of `commit_success` / `commit_failure`.
//! Readers never see a version that has not been committed.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::config::RetentionConfig;
use crate::extract::{ExtractError, Extractor};
use crate::hooks::{HookError, Hooks};
use crate::kg::KnowledgeGraph;
use crate::storage::{
    AcquireError, GraphStore, KgState, KgStatus, MetadataStore, StoreError, TaskInfo, TaskType,
};
use crate::version::{cmp_versions, VersionGen};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Synchronous trigger outcome — what the HTTP layer turns into 409 / 400.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("a task is already running")]
    Conflict {
        state: KgState,
        task: Option<TaskInfo>,
    },

    #[error("no ready version to update from; run a full build first")]
    NoBaseVersion,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failure inside a running pipeline; stringified into `KGTask.error`.
#[derive(Debug, Error)]
enum PipelineError {
    #[error("hook: {0}")]
    Hook(#[from] HookError),

    #[error("extraction: {0}")]
    Extract(#[from] ExtractError),

    #[error("store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct TriggerResult {
    pub task_id: String,
    pub status: KgStatus,
    pub version: String,
    pub base_version: Option<String>,
}

// ── Service ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct BuildService {
    inner: Arc<Inner>,
}

struct Inner {
    metadata: MetadataStore,
    graph: GraphStore,
    hooks: Hooks,
    extractor: Extractor,
    retention: RetentionConfig,
    timeout_s: u64,
    shutdown: CancellationToken,
    versions: VersionGen,
    running: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl BuildService {
    pub fn new(
        metadata: MetadataStore,
        graph: GraphStore,
        hooks: Hooks,
        extractor: Extractor,
        retention: RetentionConfig,
        timeout_s: u64,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                metadata,
                graph,
                hooks,
                extractor,
                retention,
                timeout_s,
                shutdown,
                versions: VersionGen::new(),
                running: tokio::sync::Mutex::new(None),
            }),
        }
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.inner.metadata
    }

    pub fn graph(&self) -> &GraphStore {
        &self.inner.graph
    }

    /// Admit a full build and start its pipeline in the background.
    pub async fn trigger_full_build(&self) -> Result<TriggerResult, TriggerError> {
        let version = self.inner.versions.next();
        let task = self
            .inner
            .metadata
            .try_acquire(TaskType::FullBuild, &version, None)
            .await
            .map_err(map_acquire)?;

        info!(task_id = %task.task_id, %version, "full build admitted");
        self.spawn_pipeline(task.task_id.clone(), version.clone(), None).await;

        Ok(TriggerResult {
            task_id: task.task_id,
            status: KgStatus::Building,
            version,
            base_version: None,
        })
    }

    /// Admit an incremental update based on the latest ready version.
    ///
    /// The base snapshot is taken before the CAS; it cannot move in between
    /// because `latest_ready_version` only changes while a task holds the
    /// writer slot, and the CAS would then reject us with a conflict.
    pub async fn trigger_incremental_update(&self) -> Result<TriggerResult, TriggerError> {
        let (state, _) = self.inner.metadata.read().await?;
        let base_version = state
            .latest_ready_version
            .ok_or(TriggerError::NoBaseVersion)?;

        let version = self.inner.versions.next();
        let task = self
            .inner
            .metadata
            .try_acquire(TaskType::IncrementalUpdate, &version, Some(&base_version))
            .await
            .map_err(map_acquire)?;

        info!(task_id = %task.task_id, %version, base = %base_version, "incremental update admitted");
        self.spawn_pipeline(task.task_id.clone(), version.clone(), Some(base_version.clone()))
            .await;

        Ok(TriggerResult {
            task_id: task.task_id,
            status: KgStatus::Updating,
            version,
            base_version: Some(base_version),
        })
    }

    async fn spawn_pipeline(&self, task_id: String, version: String, base_version: Option<String>) {
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            run_pipeline(inner, task_id, version, base_version).await;
        });
        *self.inner.running.lock().await = Some(handle);
    }

    /// Await the in-flight pipeline, if any. Used on shutdown and by tests.
    pub async fn join_running(&self) {
        let handle = self.inner.running.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn map_acquire(e: AcquireError) -> TriggerError {
    match e {
        AcquireError::Conflict { state, task } => TriggerError::Conflict { state, task },
        AcquireError::Store(e) => TriggerError::Store(e),
    }
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

async fn run_pipeline(
    inner: Arc<Inner>,
    task_id: String,
    version: String,
    base_version: Option<String>,
) {
    // Child token: server shutdown propagates in, a timeout cancels only us.
    let cancel = inner.shutdown.child_token();

    let work = pipeline_steps(&inner, &task_id, &version, base_version.as_deref(), &cancel);
    let outcome = if inner.timeout_s > 0 {
        match tokio::time::timeout(std::time::Duration::from_secs(inner.timeout_s), work).await {
            Ok(result) => result,
            Err(_) => {
                cancel.cancel();
                fail_task(&inner, &task_id, &version, "timeout".to_string()).await;
                return;
            }
        }
    } else {
        work.await
    };

    match outcome {
        Ok(()) => {
            info!(%task_id, %version, "pipeline completed");
            sweep_old_versions(&inner).await;
        }
        Err(e) => {
            error!(%task_id, %version, error = %e, "pipeline failed");
            fail_task(&inner, &task_id, &version, e.to_string()).await;
        }
    }
}

async fn pipeline_steps(
    inner: &Inner,
    task_id: &str,
    version: &str,
    base_version: Option<&str>,
    cancel: &CancellationToken,
) -> Result<(), PipelineError> {
    let incremental = base_version.is_some();
    progress(inner, task_id, 1, if incremental { "incremental update started" } else { "full build started" }).await;

    let chunks = match base_version {
        None => inner.hooks.full_data().await?,
        Some(base) => inner.hooks.incremental_data(base).await?,
    };
    if chunks.is_empty() {
        return Err(PipelineError::Hook(HookError::Data(
            "data hook returned no chunks; nothing to build".into(),
        )));
    }
    progress(inner, task_id, 10, &format!("fetched {} text chunks", chunks.len())).await;

    let base_graph: Option<KnowledgeGraph> = match base_version {
        None => None,
        Some(base) => {
            progress(inner, task_id, 20, "loading base version graph").await;
            Some(inner.graph.load_graph(base).await?)
        }
    };

    progress(inner, task_id, 45, "extracting knowledge graph").await;
    let obs_timestamp = Utc::now().to_rfc3339();
    let graph = inner
        .extractor
        .build(&chunks, base_graph, &obs_timestamp, cancel)
        .await?;
    progress(
        inner,
        task_id,
        75,
        &format!("extracted {} nodes, {} edges", graph.entities.len(), graph.relationships.len()),
    )
    .await;

    progress(inner, task_id, 85, "writing graph").await;
    inner.graph.write_graph(version, &graph).await?;

    progress(inner, task_id, 95, "publishing version").await;
    inner.metadata.commit_success(task_id, version).await?;
    Ok(())
}

/// Best-effort failure path: partial writes for the unpublished version are
/// deleted, then the task is marked failed. The version was never published,
/// so readers could not have observed it either way.
async fn fail_task(inner: &Inner, task_id: &str, version: &str, error: String) {
    if let Err(e) = inner.graph.delete_version(version).await {
        warn!(%version, error = %e, "cleanup of partial version failed; data stays unpublished");
    }
    if let Err(e) = inner.metadata.commit_failure(task_id, &error).await {
        error!(%task_id, error = %e, "failed to record task failure");
    }
}

async fn progress(inner: &Inner, task_id: &str, pct: u8, message: &str) {
    if let Err(e) = inner.metadata.update_progress(task_id, pct, Some(message)).await {
        warn!(%task_id, error = %e, "progress update failed");
    }
}

// ── Retention ─────────────────────────────────────────────────────────────────

/// Which versions to delete: everything past the `max_versions` most recent
/// READY versions, never including `latest`.
pub fn plan_retention(
    mut ready_versions: Vec<String>,
    latest: Option<&str>,
    max_versions: u32,
) -> Vec<String> {
    ready_versions.sort_by(|a, b| cmp_versions(b, a));
    ready_versions.dedup();
    ready_versions
        .into_iter()
        .enumerate()
        .filter(|(i, v)| *i >= max_versions as usize && Some(v.as_str()) != latest)
        .map(|(_, v)| v)
        .collect()
}

/// Post-commit sweep; failures are logged and never fail the finished task.
async fn sweep_old_versions(inner: &Inner) {
    if !inner.retention.enable_cleanup || inner.retention.max_versions == 0 {
        return;
    }

    let (latest, ready) = match (
        inner.metadata.read().await,
        inner.metadata.ready_versions().await,
    ) {
        (Ok((state, _)), Ok(ready)) => (state.latest_ready_version, ready),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "retention sweep skipped: cannot read state");
            return;
        }
    };

    let doomed = plan_retention(ready, latest.as_deref(), inner.retention.max_versions);
    for version in doomed {
        match inner.graph.delete_version(&version).await {
            Ok(()) => info!(%version, "retired old version"),
            Err(e) => warn!(%version, error = %e, "failed to delete old version"),
        }
    }
}
