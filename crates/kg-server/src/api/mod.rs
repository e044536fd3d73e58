//! HTTP surface — axum router over the orchestration core.
//!
//! ## URL layout
//!
//! ```text
//! POST /kg/build/full           → trigger a full rebuild
//! POST /kg/update/incremental   → trigger an incremental update
//! GET  /kg/status               → state machine + current/last task
//! GET  /kg/types/entities       → distinct entity labels
//! GET  /kg/types/relations      → distinct predicates
//! GET  /kg/query                → keyword subgraph / bounded slice
//! GET  /kg/stats                → node/edge/type counts
//! ```

mod handlers;
pub mod models;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::build::BuildService;
use crate::core::config::{QueryConfig, ServerConfig};
use crate::core::error::AppError;

/// Router state injected into every handler; cheap to clone.
#[derive(Clone)]
pub struct ApiState {
    pub build: BuildService,
    pub query: QueryConfig,
}

pub fn build_router(state: ApiState, cors_allow_origins: &[String]) -> Router {
    Router::new()
        .route("/kg/build/full", post(handlers::build_full))
        .route("/kg/update/incremental", post(handlers::update_incremental))
        .route("/kg/status", get(handlers::status))
        .route("/kg/types/entities", get(handlers::entity_types))
        .route("/kg/types/relations", get(handlers::relation_types))
        .route("/kg/query", get(handlers::query))
        .route("/kg/stats", get(handlers::stats))
        .layer(cors_layer(cors_allow_origins))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

/// Bind and serve until the shutdown token cancels.
pub async fn serve(
    cfg: &ServerConfig,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), AppError> {
    let bind_addr = format!("{}:{}", cfg.host, cfg.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| AppError::Server(format!("bind failed on {bind_addr}: {e}")))?;

    info!(%bind_addr, "kg-server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| AppError::Server(format!("server error: {e}")))?;

    info!("kg-server shut down");
    Ok(())
}
