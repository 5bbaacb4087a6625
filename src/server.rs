//! HTTP invocation surface.
//!
//! Thin layer over the orchestrator and matcher: parse, validate, delegate,
//! serialize. Bad parameters are rejected here with 400 before any fetch
//! happens; a partial run is a 200 whose body says partial.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::db::runs::{RunRecord, SyncMode};
use crate::db::Warehouse;
use crate::error::RunError;
use crate::matcher;
use crate::provider::{build_provider, IntelligenceProvider};
use crate::sources::SourceKind;
use crate::sync;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Mutex<Warehouse>>,
    pub config: Arc<Config>,
    pub provider: Option<Arc<dyn IntelligenceProvider>>,
}

impl AppState {
    pub fn new(db: Warehouse, config: Config) -> Self {
        let provider = build_provider(&config.provider).map(Arc::from);
        Self {
            db: Arc::new(Mutex::new(db)),
            config: Arc::new(config),
            provider,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sync/{source}", post(sync_source))
        .route("/match", post(run_matcher))
        .route("/runs", get(list_runs))
        .route("/health", get(health))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn serve(state: AppState, addr: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("listening on {addr}");
    axum::serve(listener, router(state)).await
}

// ---------------------------------------------------------------------------
// Request/response shapes
// ---------------------------------------------------------------------------

fn default_scope() -> String {
    "default".to_string()
}

fn default_mode() -> String {
    "incremental".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SyncRequest {
    scope: String,
    mode: String,
    /// Overrides the configured per-run record cap.
    batch_size: Option<usize>,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self {
            scope: default_scope(),
            mode: default_mode(),
            batch_size: None,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MatchRequest {
    batch_size: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

/// Error shape returned to callers: status code plus `{"error": ...}`.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(e: RunError) -> Self {
        let status = match &e {
            RunError::Validation(_) | RunError::UnknownSource(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn sync_source(
    State(state): State<AppState>,
    Path(source): Path<String>,
    Json(req): Json<SyncRequest>,
) -> Result<Json<RunRecord>, ApiError> {
    let kind = SourceKind::parse(&source)
        .ok_or_else(|| ApiError::bad_request(format!("unknown source: {source}")))?;
    let mode = SyncMode::parse(&req.mode)
        .ok_or_else(|| ApiError::bad_request(format!("unknown mode: {}", req.mode)))?;
    if req.scope.is_empty() {
        return Err(ApiError::bad_request("scope must not be empty"));
    }

    let mut config = (*state.config).clone();
    if let Some(n) = req.batch_size {
        if n == 0 {
            return Err(ApiError::bad_request("batch_size must be at least 1"));
        }
        config.max_records_per_run = n;
    }

    let run = sync::run_sync(
        &state.db,
        &config,
        state.provider.as_deref(),
        kind,
        &req.scope,
        mode,
    )
    .await?;
    Ok(Json(run))
}

async fn run_matcher(
    State(state): State<AppState>,
    Json(req): Json<MatchRequest>,
) -> Result<Json<RunRecord>, ApiError> {
    if req.batch_size == Some(0) {
        return Err(ApiError::bad_request("batch_size must be at least 1"));
    }
    let limit = req.batch_size.unwrap_or(state.config.max_records_per_run);
    let guard = state.db.lock().await;
    let run = matcher::run_match_pass(&guard, limit)?;
    Ok(Json(run))
}

async fn list_runs(
    State(state): State<AppState>,
    Query(query): Query<RunsQuery>,
) -> Result<Json<Vec<RunRecord>>, ApiError> {
    let limit = query.limit.unwrap_or(50);
    let guard = state.db.lock().await;
    let runs = guard.recent_runs(limit).map_err(RunError::from)?;
    Ok(Json(runs))
}

async fn health() -> &'static str {
    "ok"
}
