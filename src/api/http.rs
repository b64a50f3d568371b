//! HTTP API Server
//!
//! REST API over one table replica: insert rows, trigger an unreplicated
//! merge, and inspect replica status.

use std::sync::Arc;

use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::config::ApiConfig;
use crate::error::{Error, Result};
use crate::table::ReplicatedTable;

/// Shared application state
struct AppState {
    table: ReplicatedTable,
}

/// HTTP API server
pub struct ApiServer {
    config: ApiConfig,
    state: Arc<AppState>,
}

#[derive(Deserialize)]
struct InsertRequest {
    rows: Vec<serde_json::Value>,
    #[serde(default)]
    insert_id: Option<String>,
}

#[derive(Serialize)]
struct InsertResponse {
    written_parts: Vec<String>,
    deduplicated: usize,
}

#[derive(Serialize)]
struct StatusResponse {
    replica: String,
    is_leader: bool,
    is_read_only: bool,
    queue_size: usize,
    parts: Vec<String>,
}

impl ApiServer {
    pub fn new(config: ApiConfig, table: ReplicatedTable) -> Self {
        Self {
            config,
            state: Arc::new(AppState { table }),
        }
    }

    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/insert", post(handle_insert))
            .route("/optimize", post(handle_optimize))
            .route("/select", get(handle_select))
            .route("/status", get(handle_status))
            .route("/health", get(handle_health))
            .with_state(state)
    }

    /// Start serving; returns once the listener is bound.
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let app = Self::create_router(Arc::clone(&self.state));
        let listener = tokio::net::TcpListener::bind(&self.config.bind).await?;
        tracing::info!(address = %listener.local_addr()?, "HTTP API listening");

        tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "HTTP API server failed");
            }
        });
        Ok(())
    }
}

fn error_response(err: Error) -> (StatusCode, String) {
    let status = match &err {
        Error::TableIsReadOnly => StatusCode::SERVICE_UNAVAILABLE,
        Error::InvalidRow(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

async fn handle_insert(
    State(state): State<Arc<AppState>>,
    Json(request): Json<InsertRequest>,
) -> impl IntoResponse {
    match state.table.write(request.rows, request.insert_id).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(InsertResponse {
                written_parts: outcome.written_parts,
                deduplicated: outcome.deduplicated,
            }),
        )
            .into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn handle_optimize(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.table.optimize().await {
        Ok(merged) => (StatusCode::OK, Json(serde_json::json!({ "merged": merged })))
            .into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn handle_select(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.table.read() {
        Ok(rows) => (StatusCode::OK, Json(rows)).into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

async fn handle_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let table = &state.table;
    Json(StatusResponse {
        replica: table.replica_name().to_string(),
        is_leader: table.is_leader(),
        is_read_only: table.is_read_only(),
        queue_size: table.queue_len(),
        parts: table.part_names(),
    })
}

async fn handle_health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}
