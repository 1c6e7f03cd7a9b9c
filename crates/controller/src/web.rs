use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use crate::controller::Controller;
use crate::error::RigError;
use crate::watering::WateringConfig;

/// One hour of samples at the default 30 s period.
const DEFAULT_FLOW_POINTS: i64 = 120;

type AppState = Arc<Controller>;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

struct ApiError(RigError);

impl From<RigError> for ApiError {
    fn from(e: RigError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            e if e.is_validation() => StatusCode::BAD_REQUEST,
            RigError::ArbiterClosed => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(controller: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/programs", get(get_programs).post(save_programs))
        .route("/api/programs/{id}/run", post(run_program))
        .route("/api/circuits/{id}/run/{minutes}", post(run_circuit))
        .route("/api/cancel", post(cancel))
        .route("/api/flow", get(flow_history))
        .route("/api/valve", post(valve))
        .with_state(controller)
}

async fn api_status(State(c): State<AppState>) -> impl IntoResponse {
    Json(c.status().await)
}

async fn get_programs(State(c): State<AppState>) -> impl IntoResponse {
    Json(c.get_config().await)
}

/// Raw body so malformed documents surface as schema errors (400).
async fn save_programs(State(c): State<AppState>, body: String) -> Result<StatusCode, ApiError> {
    let config: WateringConfig =
        serde_json::from_str(&body).map_err(|e| RigError::Schema(e.to_string()))?;
    c.save_config(config).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn run_program(
    State(c): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    c.init_program(id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "program": id, "queued": true }))))
}

async fn run_circuit(
    State(c): State<AppState>,
    Path((id, minutes)): Path<(i64, i64)>,
) -> Result<impl IntoResponse, ApiError> {
    c.init_circuit(id, minutes)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "circuit": id, "minutes": minutes, "queued": true })),
    ))
}

async fn cancel(State(c): State<AppState>) -> StatusCode {
    c.stop_all();
    StatusCode::NO_CONTENT
}

#[derive(Deserialize)]
struct FlowQuery {
    points: Option<i64>,
}

async fn flow_history(
    State(c): State<AppState>,
    Query(q): Query<FlowQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let samples = c.flow_samples(q.points.unwrap_or(DEFAULT_FLOW_POINTS)).await?;
    Ok(Json(samples))
}

#[derive(Deserialize)]
struct ValveQuery {
    status: Option<bool>,
}

async fn valve(State(c): State<AppState>, Query(q): Query<ValveQuery>) -> impl IntoResponse {
    Json(json!({ "valve": c.valve_override(q.status) }))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(controller: AppState, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "http api listening");

    axum::serve(listener, router(controller))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
