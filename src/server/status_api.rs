//! Read-mostly HTTP status surface.
//!
//! - GET /health
//! - GET /metrics
//! - GET /v1/plans
//! - GET /v1/plans/{handle}
//! - POST /v1/plans/{handle}/cancel
//!
//! Plans are never submitted over HTTP.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::engine::coordinator::{PlanCoordinator, PlanHandle, PlanReport, PlanSummary};

/// Application state shared across handlers.
pub struct AppState {
    pub coordinator: PlanCoordinator,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(coordinator: PlanCoordinator) -> Arc<Self> {
        Arc::new(Self {
            coordinator,
            start_time: Instant::now(),
        })
    }
}

/// Build the axum router with all status routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/plans", get(list_plans))
        .route("/v1/plans/{handle}", get(get_plan))
        .route("/v1/plans/{handle}/cancel", post(cancel_plan))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub plans: usize,
    pub active_plans: usize,
    pub held_resources: usize,
}

#[derive(Debug, Serialize)]
pub struct PlanList {
    pub plans: Vec<PlanSummary>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub handle: PlanHandle,
    pub cancelled: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let plans = state.coordinator.list();
    let held_resources = state.coordinator.registry().lock().await.held_count();

    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_plans: plans.iter().filter(|p| !p.status.is_terminal()).count(),
        plans: plans.len(),
        held_resources,
    })
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.coordinator.metrics().render() {
        Ok(text) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn list_plans(State(state): State<Arc<AppState>>) -> Json<PlanList> {
    Json(PlanList {
        plans: state.coordinator.list(),
    })
}

async fn get_plan(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Json<PlanReport>, StatusCode> {
    let handle: PlanHandle = handle.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    state
        .coordinator
        .report(handle)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn cancel_plan(
    State(state): State<Arc<AppState>>,
    Path(handle): Path<String>,
) -> Result<Json<CancelResponse>, StatusCode> {
    let handle: PlanHandle = handle.parse().map_err(|_| StatusCode::BAD_REQUEST)?;
    if state.coordinator.status(handle).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(CancelResponse {
        handle,
        cancelled: state.coordinator.cancel(handle),
    }))
}
