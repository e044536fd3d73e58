//! Integration tests for the build orchestrator, driven end to end against
//! the in-memory stores with a scripted extractor and static hooks.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kg_server::build::{BuildService, TriggerError};
use kg_server::core::config::RetentionConfig;
use kg_server::extract::{Extractor, ScriptedExtractor};
use kg_server::hooks::{Hooks, StaticHooks};
use kg_server::kg::{Entity, EntityRef, KnowledgeGraph, Relationship};
use kg_server::storage::memory::{MemoryBackend, MemoryGraphStore, MemoryMetadataStore};
use kg_server::storage::{GraphStore, KgStatus, MetadataStore, TaskType};
use kg_server::version::cmp_versions;

// ── Helpers ───────────────────────────────────────────────────────────────────

struct Harness {
    service: BuildService,
    metadata: MetadataStore,
    graph_mem: MemoryGraphStore,
}

fn harness(extractor: Extractor, hooks: Hooks, retention: RetentionConfig, timeout_s: u64) -> Harness {
    let backend = MemoryBackend::shared();
    let metadata = MetadataStore::Memory(MemoryMetadataStore::new(backend.clone()));
    let graph_mem = MemoryGraphStore::new(backend);
    let graph = GraphStore::Memory(graph_mem.clone());
    let service = BuildService::new(
        metadata.clone(),
        graph,
        hooks,
        extractor,
        retention,
        timeout_s,
        CancellationToken::new(),
    );
    Harness { service, metadata, graph_mem }
}

fn default_retention() -> RetentionConfig {
    RetentionConfig { max_versions: 10, enable_cleanup: true }
}

fn sample_hooks() -> Hooks {
    Hooks::Static(StaticHooks::new(
        vec!["Alice knows Bob.".to_string(), "Bob lives in Paris.".to_string()],
        vec!["Alice moved to Berlin.".to_string()],
    ))
}

fn entity(label: &str, name: &str) -> Entity {
    Entity { label: label.into(), name: name.into(), embeddings: None }
}

fn relation(src: (&str, &str), pred: &str, tgt: (&str, &str)) -> Relationship {
    Relationship {
        source: EntityRef::new(src.0, src.1),
        target: EntityRef::new(tgt.0, tgt.1),
        predicate: pred.into(),
        atomic_facts: vec![],
        t_obs: vec![],
        t_start: vec![],
        t_end: vec![],
        embeddings: None,
    }
}

/// Alice/Bob/Paris — 3 entities, 2 relations, 2 entity types.
fn alice_graph() -> KnowledgeGraph {
    let mut g = KnowledgeGraph::default();
    g.upsert_entity(entity("person", "Alice"));
    g.upsert_entity(entity("person", "Bob"));
    g.upsert_entity(entity("location", "Paris"));
    g.upsert_relationship(relation(("person", "Alice"), "knows", ("person", "Bob")));
    g.upsert_relationship(relation(("person", "Bob"), "lives_in", ("location", "Paris")));
    g
}

fn berlin_graph() -> KnowledgeGraph {
    let mut g = KnowledgeGraph::default();
    g.upsert_entity(entity("person", "Alice"));
    g.upsert_entity(entity("location", "Berlin"));
    g.upsert_relationship(relation(("person", "Alice"), "moved_to", ("location", "Berlin")));
    g
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn first_full_build_publishes_and_serves_stats() {
    let h = harness(
        Extractor::Scripted(ScriptedExtractor::new(vec![alice_graph()])),
        sample_hooks(),
        default_retention(),
        0,
    );

    let r = h.service.trigger_full_build().await.unwrap();
    assert_eq!(r.status, KgStatus::Building);
    assert_eq!(r.task_id, r.version);
    assert!(r.base_version.is_none());

    h.service.join_running().await;

    let (state, _) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Ready);
    assert_eq!(state.latest_ready_version.as_deref(), Some(r.version.as_str()));
    assert!(state.current_task_id.is_none());

    let stats = h.service.graph().stats(&r.version).await.unwrap();
    assert_eq!(stats.entity_count, 3);
    assert_eq!(stats.relation_count, 2);
    assert!(stats.node_type_count >= 1);
}

#[tokio::test]
async fn incremental_without_base_is_rejected() {
    let h = harness(
        Extractor::Scripted(ScriptedExtractor::new(vec![alice_graph()])),
        sample_hooks(),
        default_retention(),
        0,
    );
    let err = h.service.trigger_incremental_update().await.unwrap_err();
    assert!(matches!(err, TriggerError::NoBaseVersion));
}

#[tokio::test]
async fn second_trigger_conflicts_while_first_runs() {
    let h = harness(
        Extractor::Scripted(
            ScriptedExtractor::new(vec![alice_graph()]).with_delay(Duration::from_millis(300)),
        ),
        sample_hooks(),
        default_retention(),
        0,
    );

    let first = h.service.trigger_full_build().await.unwrap();
    let err = h.service.trigger_full_build().await.unwrap_err();
    match err {
        TriggerError::Conflict { state, task } => {
            assert_eq!(state.status, KgStatus::Building);
            let task = task.expect("running task in conflict detail");
            assert_eq!(task.task_id, first.task_id);
            assert_eq!(task.version, first.version);
        }
        other => panic!("expected conflict, got {other:?}"),
    }

    h.service.join_running().await;
    let (state, _) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Ready);
}

#[tokio::test]
async fn racing_triggers_admit_exactly_one() {
    let h = harness(
        Extractor::Scripted(
            ScriptedExtractor::new(vec![alice_graph()]).with_delay(Duration::from_millis(200)),
        ),
        sample_hooks(),
        default_retention(),
        0,
    );

    let (a, b) = tokio::join!(h.service.trigger_full_build(), h.service.trigger_full_build());
    let winners = [a.is_ok(), b.is_ok()].iter().filter(|w| **w).count();
    assert_eq!(winners, 1, "exactly one concurrent trigger may win");
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(loser, Err(TriggerError::Conflict { .. })));

    h.service.join_running().await;
}

#[tokio::test]
async fn failed_pipeline_preserves_previous_version() {
    let h = harness(
        Extractor::Scripted(ScriptedExtractor::new(vec![alice_graph()])),
        sample_hooks(),
        default_retention(),
        0,
    );

    let v1 = h.service.trigger_full_build().await.unwrap().version;
    h.service.join_running().await;

    // Second build fails inside extraction.
    let failing = harness_with_existing(&h, Extractor::Scripted(ScriptedExtractor::failing("model exploded")));
    let v2 = failing.trigger_full_build().await.unwrap().version;
    failing.join_running().await;

    let (state, task) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Failed);
    assert_eq!(state.latest_ready_version.as_deref(), Some(v1.as_str()));
    let task = task.expect("failed task surfaced");
    assert_eq!(task.task_id, v2);
    assert!(task.error.as_deref().unwrap_or_default().contains("model exploded"));

    // No partial data for the failed version.
    assert_eq!(h.graph_mem.stored_versions(), vec![v1.clone()]);

    // The failed state still admits the next trigger.
    let recovered = harness_with_existing(&h, Extractor::Scripted(ScriptedExtractor::new(vec![alice_graph()])));
    let v3 = recovered.trigger_full_build().await.unwrap().version;
    recovered.join_running().await;
    let (state, _) = h.metadata.read().await.unwrap();
    assert_eq!(state.latest_ready_version.as_deref(), Some(v3.as_str()));
}

/// Rebuild a service over the same stores with a different extractor.
fn harness_with_existing(h: &Harness, extractor: Extractor) -> BuildService {
    BuildService::new(
        h.metadata.clone(),
        GraphStore::Memory(h.graph_mem.clone()),
        sample_hooks(),
        extractor,
        default_retention(),
        0,
        CancellationToken::new(),
    )
}

#[tokio::test]
async fn hook_failure_is_prefixed_and_commits_nothing() {
    let h = harness(
        Extractor::Scripted(ScriptedExtractor::new(vec![alice_graph()])),
        Hooks::Static(StaticHooks::failing("source database offline")),
        default_retention(),
        0,
    );

    h.service.trigger_full_build().await.unwrap();
    h.service.join_running().await;

    let (state, task) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Failed);
    assert!(state.latest_ready_version.is_none());
    let error = task.unwrap().error.unwrap();
    assert!(error.starts_with("hook:"), "got: {error}");
    assert!(error.contains("source database offline"));
}

#[tokio::test]
async fn empty_hook_output_fails_the_build() {
    let h = harness(
        Extractor::Scripted(ScriptedExtractor::new(vec![alice_graph()])),
        Hooks::Static(StaticHooks::new(vec![], vec![])),
        default_retention(),
        0,
    );

    h.service.trigger_full_build().await.unwrap();
    h.service.join_running().await;

    let (state, task) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Failed);
    assert!(task.unwrap().error.unwrap().starts_with("hook:"));
}

#[tokio::test]
async fn incremental_update_builds_on_base_version() {
    let h = harness(
        Extractor::Scripted(ScriptedExtractor::new(vec![alice_graph(), berlin_graph()])),
        sample_hooks(),
        default_retention(),
        0,
    );

    let v1 = h.service.trigger_full_build().await.unwrap().version;
    h.service.join_running().await;

    let r = h.service.trigger_incremental_update().await.unwrap();
    assert_eq!(r.status, KgStatus::Updating);
    assert_eq!(r.base_version.as_deref(), Some(v1.as_str()));
    h.service.join_running().await;

    let (state, _) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Ready);
    let v2 = state.latest_ready_version.unwrap();
    assert_ne!(v1, v2);
    assert_eq!(cmp_versions(&v1, &v2), std::cmp::Ordering::Less);

    // New version carries base + delta; base version is untouched.
    let merged = h.service.graph().load_graph(&v2).await.unwrap();
    assert_eq!(merged.entities.len(), 4); // Alice, Bob, Paris + Berlin
    assert_eq!(merged.relationships.len(), 3);
    let base = h.service.graph().load_graph(&v1).await.unwrap();
    assert_eq!(base.entities.len(), 3);

    // Task record remembers its type and base.
    let versions = h.metadata.ready_versions().await.unwrap();
    assert!(versions.contains(&v1) && versions.contains(&v2));
}

#[tokio::test]
async fn incremental_task_records_base_version() {
    let h = harness(
        Extractor::Scripted(
            ScriptedExtractor::new(vec![alice_graph(), berlin_graph()])
                .with_delay(Duration::from_millis(100)),
        ),
        sample_hooks(),
        default_retention(),
        0,
    );
    let v1 = h.service.trigger_full_build().await.unwrap().version;
    h.service.join_running().await;

    h.service.trigger_incremental_update().await.unwrap();
    let (state, task) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Updating);
    let task = task.expect("running task");
    assert_eq!(task.task_type, TaskType::IncrementalUpdate);
    assert_eq!(task.base_version.as_deref(), Some(v1.as_str()));
    h.service.join_running().await;
}

#[tokio::test]
async fn crash_recovery_sweeps_to_failed_and_readmits() {
    let h = harness(
        Extractor::Scripted(ScriptedExtractor::new(vec![alice_graph(), alice_graph()])),
        sample_hooks(),
        default_retention(),
        0,
    );

    let v1 = h.service.trigger_full_build().await.unwrap().version;
    h.service.join_running().await;

    // Simulate a crash mid-build: the CAS landed but no commit ever ran.
    h.metadata
        .try_acquire(TaskType::FullBuild, "9999999999999", None)
        .await
        .unwrap();

    h.metadata.recover_on_startup().await.unwrap();

    let (state, task) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Failed);
    assert!(state.current_task_id.is_none());
    assert_eq!(state.latest_ready_version.as_deref(), Some(v1.as_str()));
    assert_eq!(task.unwrap().error.as_deref(), Some("server restarted"));

    // Recovery is idempotent.
    h.metadata.recover_on_startup().await.unwrap();

    // A subsequent trigger succeeds.
    h.service.trigger_full_build().await.unwrap();
    h.service.join_running().await;
    let (state, _) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Ready);
}

#[tokio::test]
async fn retention_sweep_keeps_newest_versions_only() {
    let graphs = vec![alice_graph(), alice_graph(), alice_graph(), alice_graph()];
    let h = harness(
        Extractor::Scripted(ScriptedExtractor::new(graphs)),
        sample_hooks(),
        RetentionConfig { max_versions: 2, enable_cleanup: true },
        0,
    );

    let mut versions = Vec::new();
    for _ in 0..4 {
        versions.push(h.service.trigger_full_build().await.unwrap().version);
        h.service.join_running().await;
    }

    // Monotonic publication across commits.
    for pair in versions.windows(2) {
        assert_eq!(cmp_versions(&pair[0], &pair[1]), std::cmp::Ordering::Less);
    }

    // Only the two newest versions hold data; the latest one was never deleted.
    let stored = h.graph_mem.stored_versions();
    assert_eq!(stored, vec![versions[2].clone(), versions[3].clone()]);

    let (state, _) = h.metadata.read().await.unwrap();
    assert_eq!(state.latest_ready_version.as_deref(), Some(versions[3].as_str()));
    let stats = h.service.graph().stats(&versions[3]).await.unwrap();
    assert_eq!(stats.entity_count, 3);
}

#[tokio::test]
async fn retention_disabled_keeps_everything() {
    let h = harness(
        Extractor::Scripted(ScriptedExtractor::new(vec![alice_graph(), alice_graph(), alice_graph()])),
        sample_hooks(),
        RetentionConfig { max_versions: 1, enable_cleanup: false },
        0,
    );
    for _ in 0..3 {
        h.service.trigger_full_build().await.unwrap();
        h.service.join_running().await;
    }
    assert_eq!(h.graph_mem.stored_versions().len(), 3);
}

#[tokio::test]
async fn timeout_aborts_pipeline_and_fails_task() {
    let h = harness(
        Extractor::Scripted(
            ScriptedExtractor::new(vec![alice_graph()]).with_delay(Duration::from_secs(30)),
        ),
        sample_hooks(),
        default_retention(),
        1,
    );

    h.service.trigger_full_build().await.unwrap();
    h.service.join_running().await;

    let (state, task) = h.metadata.read().await.unwrap();
    assert_eq!(state.status, KgStatus::Failed);
    assert!(state.latest_ready_version.is_none());
    assert_eq!(task.unwrap().error.as_deref(), Some("timeout"));
    assert!(h.graph_mem.stored_versions().is_empty());
}
