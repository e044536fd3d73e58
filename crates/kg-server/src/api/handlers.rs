//! Axum handlers for the `/kg/*` routes.
//!
//! Each handler receives [`ApiState`] via [`axum::extract::State`] and
//! returns the JSON envelope from [`super::models`]. Reads resolve
//! `latest_ready_version` at request time, so they only ever see committed
//! versions regardless of any build in flight.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde_json::json;
use tracing::{info, warn};

use crate::build::TriggerError;
use crate::storage::{QueryLimits, StoreError, GRAPH_NAME_DEFAULT};

use super::models::*;
use super::ApiState;

/// GET /kg/status
pub(super) async fn status(State(state): State<ApiState>) -> Response {
    match state.build.metadata().read().await {
        Ok((kg_state, task)) => ok(StatusResponse {
            status: kg_state.status,
            latest_ready_version: kg_state.latest_ready_version,
            current_task: task,
        }),
        Err(e) => store_err(e),
    }
}

/// POST /kg/build/full
pub(super) async fn build_full(
    State(state): State<ApiState>,
    body: Option<Json<TriggerRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    if let Some(resp) = reject_foreign_graph(&req) {
        return resp;
    }
    if let Some(source) = &req.trigger_source {
        info!(%source, "full build requested");
    }

    match state.build.trigger_full_build().await {
        Ok(r) => ok(TriggerFullBuildResponse {
            task_id: r.task_id,
            status: r.status,
            version: r.version,
        }),
        Err(e) => trigger_err(e),
    }
}

/// POST /kg/update/incremental
pub(super) async fn update_incremental(
    State(state): State<ApiState>,
    body: Option<Json<TriggerRequest>>,
) -> Response {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    if let Some(resp) = reject_foreign_graph(&req) {
        return resp;
    }
    if let Some(source) = &req.trigger_source {
        info!(%source, "incremental update requested");
    }

    match state.build.trigger_incremental_update().await {
        Ok(r) => ok(TriggerIncrementalUpdateResponse {
            task_id: r.task_id,
            status: r.status,
            base_version: r.base_version.unwrap_or_default(),
            version: r.version,
        }),
        Err(e) => trigger_err(e),
    }
}

/// GET /kg/types/entities
pub(super) async fn entity_types(State(state): State<ApiState>) -> Response {
    let version = match ready_version(&state).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.build.graph().entity_types(&version).await {
        Ok(types) => ok(TypesResponse {
            version,
            entity_types: Some(types),
            relation_types: None,
        }),
        Err(e) => store_err(e),
    }
}

/// GET /kg/types/relations
pub(super) async fn relation_types(State(state): State<ApiState>) -> Response {
    let version = match ready_version(&state).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.build.graph().relation_types(&version).await {
        Ok(types) => ok(TypesResponse {
            version,
            entity_types: None,
            relation_types: Some(types),
        }),
        Err(e) => store_err(e),
    }
}

/// GET /kg/query
pub(super) async fn query(
    State(state): State<ApiState>,
    Query(params): Query<QueryParams>,
) -> Response {
    let version = match ready_version(&state).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    if params.limit_nodes == Some(0) {
        return err(
            StatusCode::BAD_REQUEST,
            ErrorCode::BadRequest,
            "limit_nodes must be at least 1",
            None,
        );
    }
    let depth = params.depth.unwrap_or(state.query.default_depth);
    if depth > state.query.max_depth {
        return err(
            StatusCode::BAD_REQUEST,
            ErrorCode::BadRequest,
            format!("depth must not exceed {}", state.query.max_depth),
            None,
        );
    }

    let limits = QueryLimits {
        limit_nodes: params.limit_nodes.unwrap_or(state.query.default_limit_nodes),
        limit_edges: params.limit_edges.unwrap_or(state.query.default_limit_edges),
        depth,
        max_seed_nodes: state.query.max_seed_nodes,
        include_properties: params.include_properties,
    };

    match state
        .build
        .graph()
        .query(&version, params.q.as_deref(), &limits)
        .await
    {
        Ok(slice) => ok(QueryResponse {
            version,
            nodes: slice.nodes,
            edges: slice.edges,
            truncated: slice.truncated,
        }),
        Err(e) => store_err(e),
    }
}

/// GET /kg/stats
pub(super) async fn stats(State(state): State<ApiState>) -> Response {
    let version = match ready_version(&state).await {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    match state.build.graph().stats(&version).await {
        Ok(s) => ok(StatsResponse {
            version,
            entity_count: s.entity_count,
            relation_count: s.relation_count,
            node_type_count: s.node_type_count,
        }),
        Err(e) => store_err(e),
    }
}

// ── Shared plumbing ───────────────────────────────────────────────────────────

/// The single-graph deployment only accepts `graph_name` = "default".
fn reject_foreign_graph(req: &TriggerRequest) -> Option<Response> {
    match &req.graph_name {
        Some(name) if name.trim() != GRAPH_NAME_DEFAULT => Some(err(
            StatusCode::BAD_REQUEST,
            ErrorCode::BadRequest,
            format!("only graph_name={GRAPH_NAME_DEFAULT} is supported"),
            None,
        )),
        _ => None,
    }
}

/// The version reads are served from, or 404 when nothing is published yet.
async fn ready_version(state: &ApiState) -> Result<String, Response> {
    match state.build.metadata().read().await {
        Ok((kg_state, _)) => kg_state.latest_ready_version.ok_or_else(|| {
            err(
                StatusCode::NOT_FOUND,
                ErrorCode::NotFound,
                "no completed version to query yet",
                None,
            )
        }),
        Err(e) => Err(store_err(e)),
    }
}

fn store_err(e: StoreError) -> Response {
    warn!(error = %e, "graph database error");
    err(
        StatusCode::INTERNAL_SERVER_ERROR,
        ErrorCode::Neo4jError,
        e.to_string(),
        None,
    )
}

fn trigger_err(e: TriggerError) -> Response {
    match e {
        TriggerError::Conflict { state, task } => {
            let detail = json!(StatusResponse {
                status: state.status,
                latest_ready_version: state.latest_ready_version,
                current_task: task,
            });
            err(
                StatusCode::CONFLICT,
                ErrorCode::TaskRunning,
                "a build or update task is already running",
                Some(detail),
            )
        }
        TriggerError::NoBaseVersion => err(
            StatusCode::BAD_REQUEST,
            ErrorCode::NoBaseVersion,
            "no latest_ready_version; run a full build first",
            None,
        ),
        TriggerError::Store(e) => store_err(e),
    }
}
