//! Control API
//!
//! JSON over HTTP for the status dashboard and operator console:
//! - `GET /api/status` - registry snapshot, cached routing state, runs
//! - `POST /api/deploy` - start a strategy (supersedes any active run)
//! - `POST /api/advance` - one step of the active run
//! - `POST /api/abort` - abort the active canary
//! - `POST /api/kill-instance` - fire-and-forget instance delete
//! - `POST /api/reset` - back to baseline
//!
//! Errors come back as `{"error": "<Kind>", "reason": "<message>"}`.

use crate::cluster::{Instance, ObservedRouting};
use crate::controller::{
    ChaosInjector, ControllerError, DeployRequest, PodRegistry, StrategyEngine, StrategyRun,
    TrafficRouter, VersionCount,
};
use crate::server::health::{probe_router, ReadinessState};
use crate::server::metrics::SharedMetrics;
use crate::server::shutdown::ShutdownSignal;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Handles shared by every Control API request
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<StrategyEngine>,
    pub registry: Arc<PodRegistry>,
    pub router: Arc<TrafficRouter>,
    pub chaos: Arc<ChaosInjector>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerStatus {
    pub instances: Vec<Instance>,
    /// Counts for every configured version, from the last snapshot
    pub versions: BTreeMap<String, VersionCount>,
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Last routing the router saw; None until the first successful read
    pub routing: Option<ObservedRouting>,
    /// Set when the most recent routing read failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routing_error: Option<String>,
    pub active_strategy: Option<StrategyRun>,
    pub last_run: Option<StrategyRun>,
}

#[derive(Debug, Deserialize)]
struct KillRequest {
    name: String,
}

/// Wire form of [`ControllerError`]
pub struct ApiError(ControllerError);

impl From<ControllerError> for ApiError {
    fn from(err: ControllerError) -> Self {
        ApiError(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(ControllerError::InvalidRequest(rejection.body_text()))
    }
}

pub fn status_code(err: &ControllerError) -> StatusCode {
    match err.kind() {
        "ClusterUnreachable" => StatusCode::SERVICE_UNAVAILABLE,
        "GroupNotFound" | "RoutingNotFound" => StatusCode::NOT_FOUND,
        "RoutingConflict" | "StepInProgress" | "NotAbortable" => StatusCode::CONFLICT,
        "InvalidWeights" | "InsufficientCapacity" => StatusCode::UNPROCESSABLE_ENTITY,
        "InvalidRequest" => StatusCode::BAD_REQUEST,
        "Api" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_code(&self.0);
        debug!(status = status.as_u16(), error = %self.0, "Control request rejected");
        let body = json!({
            "error": self.0.kind(),
            "reason": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

async fn current_status(state: &AppState) -> ControllerStatus {
    let snapshot = state.registry.snapshot().await;
    let mut versions = snapshot.counts();
    for version in &state.engine.settings().versions {
        versions.entry(version.clone()).or_default();
    }

    let routing = state.router.routing_view();
    let runs = state.engine.runs();

    ControllerStatus {
        instances: snapshot.instances.clone(),
        versions,
        refreshed_at: snapshot.refreshed_at,
        routing: routing.observed,
        routing_error: routing.error,
        active_strategy: runs.active,
        last_run: runs.last,
    }
}

async fn status(State(state): State<AppState>) -> Json<ControllerStatus> {
    Json(current_status(&state).await)
}

async fn deploy(
    State(state): State<AppState>,
    body: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<Json<StrategyRun>, ApiError> {
    let Json(request) = body?;
    let run = state.engine.deploy(request).await?;
    Ok(Json(run))
}

fn run_or_no_content(run: Option<StrategyRun>) -> Response {
    match run {
        Some(run) => Json(run).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

async fn advance(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(run_or_no_content(state.engine.advance().await?))
}

async fn abort(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(run_or_no_content(state.engine.abort().await?))
}

async fn kill_instance(
    State(state): State<AppState>,
    body: Result<Json<KillRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;
    if request.name.trim().is_empty() {
        return Err(ControllerError::InvalidRequest("instance name is empty".to_string()).into());
    }
    state.chaos.kill(&request.name).await;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "accepted": request.name })),
    ))
}

async fn reset(State(state): State<AppState>) -> Result<Json<ControllerStatus>, ApiError> {
    state.engine.reset().await?;
    Ok(Json(current_status(&state).await))
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/deploy", post(deploy))
        .route("/api/advance", post(advance))
        .route("/api/abort", post(abort))
        .route("/api/kill-instance", post(kill_instance))
        .route("/api/reset", post(reset))
        .with_state(state)
}

/// Control API plus probes and metrics on one listener
pub fn build_router(state: AppState, readiness: ReadinessState, metrics: SharedMetrics) -> Router {
    api_router(state).merge(probe_router(readiness, metrics))
}

/// Serve `app` until the shutdown signal fires, then drain in-flight requests
pub async fn serve(
    listener: TcpListener,
    app: Router,
    mut shutdown: ShutdownSignal,
) -> Result<(), std::io::Error> {
    let addr = listener.local_addr()?;
    info!(%addr, "Control API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[path = "api_test.rs"]
mod tests;
