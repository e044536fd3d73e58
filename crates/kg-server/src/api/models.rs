//! API response envelope and endpoint payloads.
//!
//! Every response is `{success, data, error}`; `error` carries one of the
//! fixed machine-readable codes plus a human message and optional detail.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{EdgeView, KgStatus, NodeView, TaskInfo};

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    TaskRunning,
    NoBaseVersion,
    HookFailed,
    Neo4jError,
    BadRequest,
    NotFound,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ApiError>,
}

/// 200 with a data payload.
pub fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
    .into_response()
}

/// Error with a fixed code; `detail` is optional structured context.
pub fn err(
    status: StatusCode,
    code: ErrorCode,
    message: impl Into<String>,
    detail: Option<Value>,
) -> Response {
    (
        status,
        Json(ApiResponse::<Value> {
            success: false,
            data: None,
            error: Some(ApiError {
                code,
                message: message.into(),
                detail,
            }),
        }),
    )
        .into_response()
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct TriggerRequest {
    pub graph_name: Option<String>,
    /// Free-text provenance of the trigger; logged, not stored.
    pub trigger_source: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct QueryParams {
    pub q: Option<String>,
    pub limit_nodes: Option<usize>,
    pub limit_edges: Option<usize>,
    pub depth: Option<usize>,
    #[serde(default)]
    pub include_properties: bool,
}

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: KgStatus,
    pub latest_ready_version: Option<String>,
    pub current_task: Option<TaskInfo>,
}

#[derive(Debug, Serialize)]
pub struct TriggerFullBuildResponse {
    pub task_id: String,
    pub status: KgStatus,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct TriggerIncrementalUpdateResponse {
    pub task_id: String,
    pub status: KgStatus,
    pub version: String,
    pub base_version: String,
}

#[derive(Debug, Serialize)]
pub struct TypesResponse {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation_types: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub version: String,
    pub nodes: Vec<NodeView>,
    pub edges: Vec<EdgeView>,
    pub truncated: bool,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub version: String,
    pub entity_count: u64,
    pub relation_count: u64,
    pub node_type_count: u64,
}
