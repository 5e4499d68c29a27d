//! Web server module: axum HTTP front for the control API
//!
//! - `GET /api/status` — last-known status of every component
//! - `GET /api/events?limit=N` — recent events, newest first
//! - `GET /api/config` — effective pipeline configuration
//! - `GET /api/bus` — per-topic publish/drop counters
//! - `GET /api/segments` — stored segments (404 without a store)
//! - `POST /api/commands` — submit a command, e.g. `{"kind": "lock"}`
//! - `POST /api/door/unlock?hold_ms=N`, `POST /api/door/lock` — shortcuts

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::api::ControlApi;
use crate::{Command, CommandKind, PipelineConfig, PipelineError};

const DEFAULT_EVENT_LIMIT: usize = 20;

/// Shared state for the web server
struct WebState {
    api: ControlApi,
    config: PipelineConfig,
}

/// Errors returned to HTTP callers
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::InvalidCommand(msg) => ApiError::Validation(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            warn!("API error: {}", self);
        }
        let body = Json(json!({
            "error": {
                "code": code,
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

/// Build the router. Exposed separately from [`start`] for tests.
pub fn router(api: ControlApi, config: PipelineConfig) -> Router {
    let state = Arc::new(WebState { api, config });

    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/events", get(api_events))
        .route("/api/config", get(api_config))
        .route("/api/bus", get(api_bus))
        .route("/api/segments", get(api_segments))
        .route("/api/commands", post(api_commands))
        .route("/api/door/unlock", post(door_unlock))
        .route("/api/door/lock", post(door_lock))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until cancelled.
pub async fn start(
    api: ControlApi,
    config: PipelineConfig,
    bind: SocketAddr,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .context(format!("Failed to bind to {}", bind))?;
    serve(listener, api, config, cancel).await
}

/// Serve on an already-bound listener until cancelled.
pub async fn serve(
    listener: TcpListener,
    api: ControlApi,
    config: PipelineConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let addr = listener.local_addr()?;
    info!("Web server listening on http://{}", addr);

    axum::serve(listener, router(api, config))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("Web server error")?;

    info!("Web server stopped");
    Ok(())
}

/// GET /api/status
async fn api_status(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(state.api.status().await)
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

/// GET /api/events
async fn api_events(
    State(state): State<Arc<WebState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_EVENT_LIMIT);
    Json(state.api.recent_events(limit))
}

/// GET /api/config
async fn api_config(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(state.config.clone())
}

/// GET /api/bus
async fn api_bus(State(state): State<Arc<WebState>>) -> impl IntoResponse {
    Json(state.api.bus_stats())
}

/// GET /api/segments
async fn api_segments(State(state): State<Arc<WebState>>) -> Result<Response, ApiError> {
    match state.api.segments().await {
        Some(Ok(segments)) => Ok(Json(segments).into_response()),
        Some(Err(e)) => Err(ApiError::Internal(format!("{:#}", e))),
        None => Err(ApiError::NotFound("no segment store attached".into())),
    }
}

fn accepted(command: Command) -> Response {
    (StatusCode::ACCEPTED, Json(command)).into_response()
}

/// POST /api/commands
///
/// Bodies that do not parse as a command are rejected by the extractor
/// (400/415/422) and never reach the bus.
async fn api_commands(
    State(state): State<Arc<WebState>>,
    Json(kind): Json<CommandKind>,
) -> Result<Response, ApiError> {
    Ok(accepted(state.api.submit(kind)?))
}

#[derive(Debug, Deserialize)]
struct UnlockQuery {
    hold_ms: Option<u64>,
}

/// POST /api/door/unlock
async fn door_unlock(
    State(state): State<Arc<WebState>>,
    Query(query): Query<UnlockQuery>,
) -> Result<Response, ApiError> {
    let kind = CommandKind::Unlock {
        hold_ms: query.hold_ms,
    };
    Ok(accepted(state.api.submit(kind)?))
}

/// POST /api/door/lock
async fn door_lock(State(state): State<Arc<WebState>>) -> Result<Response, ApiError> {
    Ok(accepted(state.api.submit(CommandKind::Lock)?))
}
