//! HTTP routes for the screener service.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::execution::{ExecutionError, Position, Recommendation, RecommendationStatus, SystemHealth};
use crate::funnel::{FunnelRunResult, Phase, StageRecord, StageRunResult};
use crate::store::{QualificationStore, RecordFilter, RecordSort, RunAuditEntry};
use crate::ScreenerState;

const DEFAULT_RUNS_LIMIT: usize = 20;

// ============================================================================
// Errors
// ============================================================================

/// Error body returned by every handler.
#[derive(Debug)]
pub struct ApiError(pub sieve_common::Error);

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self.0.status_code() {
            400 => "INVALID_REQUEST",
            404 => "NOT_FOUND",
            408 => "TIMEOUT",
            409 => "CONFLICT",
            502 => "UPSTREAM_ERROR",
            _ => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        let body = serde_json::json!({
            "success": false,
            "error": ErrorBody {
                code: self.code(),
                message: self.0.to_string(),
            }
        });
        (status, Json(body)).into_response()
    }
}

impl From<sieve_common::Error> for ApiError {
    fn from(err: sieve_common::Error) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(sieve_common::Error::Storage(format!("{err:#}")))
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        Self(err.into())
    }
}

pub type ApiResult<T> = Result<Json<T>, ApiError>;

fn parse_phase(raw: &str) -> Result<Phase, ApiError> {
    raw.parse::<Phase>()
        .map_err(|e| ApiError(sieve_common::Error::InvalidInput(e)))
}

// ============================================================================
// Request / Response Types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct FunnelRunQuery {
    /// Skip phases before this one
    #[serde(default)]
    pub start_from: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordsQuery {
    #[serde(default)]
    pub qualified: bool,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub sort: RecordSort,
}

#[derive(Debug, Serialize)]
pub struct RecordsResponse {
    pub phase: Phase,
    pub records: Vec<StageRecord>,
    pub count: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct RunsQuery {
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct RunsResponse {
    pub runs: Vec<RunAuditEntry>,
    pub count: usize,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecommendationsQuery {
    #[serde(default)]
    pub status: Option<RecommendationStatus>,
}

#[derive(Debug, Serialize)]
pub struct RecommendationsResponse {
    pub recommendations: Vec<Recommendation>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct ApproveResponse {
    pub recommendation: Recommendation,
    pub position: Position,
}

#[derive(Debug, Default, Deserialize)]
pub struct PositionsQuery {
    #[serde(default)]
    pub open_only: bool,
}

#[derive(Debug, Serialize)]
pub struct PositionsResponse {
    pub positions: Vec<Position>,
    pub open_count: usize,
    pub open_risk: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClosePositionRequest {
    #[serde(default)]
    pub exit_price: Option<f64>,
}

#[derive(Debug, Serialize)]
pub struct SystemHealthResponse {
    #[serde(flatten)]
    pub health: SystemHealth,
    pub run_in_progress: bool,
}

// ============================================================================
// Route Handlers
// ============================================================================

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service: "sieve-screener".to_string(),
    })
}

/// Run the full funnel; 409 while another run is in progress.
pub async fn run_funnel(
    State(state): State<Arc<ScreenerState>>,
    Query(query): Query<FunnelRunQuery>,
) -> ApiResult<FunnelRunResult> {
    let start_from = query.start_from.as_deref().map(parse_phase).transpose()?;
    Ok(Json(state.run_funnel(start_from).await?))
}

/// Run one phase standalone.
pub async fn run_stage(
    State(state): State<Arc<ScreenerState>>,
    Path(phase): Path<String>,
) -> ApiResult<StageRunResult> {
    let phase = parse_phase(&phase)?;
    Ok(Json(state.run_stage(phase).await?))
}

/// Current records of one phase.
pub async fn get_stage_records(
    State(state): State<Arc<ScreenerState>>,
    Path(phase): Path<String>,
    Query(query): Query<RecordsQuery>,
) -> ApiResult<RecordsResponse> {
    let phase = parse_phase(&phase)?;
    let filter = RecordFilter {
        qualified_only: query.qualified,
        limit: query.limit,
        ..Default::default()
    };
    let records = state
        .store
        .find_latest_per_identifier(phase, &filter, query.sort)
        .await?;
    let count = records.len();
    Ok(Json(RecordsResponse { phase, records, count }))
}

/// Recent run audit entries, newest first.
pub async fn get_runs(
    State(state): State<Arc<ScreenerState>>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<RunsResponse> {
    let runs = state
        .store
        .recent_runs(query.limit.unwrap_or(DEFAULT_RUNS_LIMIT))
        .await?;
    let count = runs.len();
    Ok(Json(RunsResponse { runs, count }))
}

pub async fn get_recommendations(
    State(state): State<Arc<ScreenerState>>,
    Query(query): Query<RecommendationsQuery>,
) -> ApiResult<RecommendationsResponse> {
    let recommendations = state.tracker.recommendations(query.status).await?;
    let count = recommendations.len();
    Ok(Json(RecommendationsResponse { recommendations, count }))
}

/// Approve a draft card and open a pending position for it.
pub async fn approve_recommendation(
    State(state): State<Arc<ScreenerState>>,
    Path(id): Path<String>,
) -> ApiResult<ApproveResponse> {
    let (recommendation, position) = state.tracker.approve(&id, Utc::now()).await?;
    Ok(Json(ApproveResponse { recommendation, position }))
}

pub async fn get_positions(
    State(state): State<Arc<ScreenerState>>,
    Query(query): Query<PositionsQuery>,
) -> ApiResult<PositionsResponse> {
    let positions = state.tracker.positions(query.open_only).await?;
    let open_count = positions.iter().filter(|p| p.status.is_live()).count();
    let open_risk = positions.iter().map(Position::open_risk).sum();
    let unrealized_pnl = positions.iter().filter_map(Position::unrealized_pnl).sum();
    Ok(Json(PositionsResponse {
        positions,
        open_count,
        open_risk,
        unrealized_pnl,
    }))
}

pub async fn close_position(
    State(state): State<Arc<ScreenerState>>,
    Path(id): Path<String>,
    Json(request): Json<ClosePositionRequest>,
) -> ApiResult<Position> {
    Ok(Json(state.tracker.close_position(&id, request.exit_price, Utc::now()).await?))
}

pub async fn get_system_health(State(state): State<Arc<ScreenerState>>) -> ApiResult<SystemHealthResponse> {
    let health = state.tracker.system_health(Utc::now()).await?;
    Ok(Json(SystemHealthResponse {
        health,
        run_in_progress: state.runs.is_busy(),
    }))
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(state: Arc<ScreenerState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/funnel/run", post(run_funnel))
        .route("/api/v1/stages/:phase/run", post(run_stage))
        .route("/api/v1/stages/:phase/records", get(get_stage_records))
        .route("/api/v1/runs", get(get_runs))
        .route("/api/v1/recommendations", get(get_recommendations))
        .route("/api/v1/recommendations/:id/approve", post(approve_recommendation))
        .route("/api/v1/positions", get(get_positions))
        .route("/api/v1/positions/:id/close", post(close_position))
        .route("/api/v1/health/system", get(get_system_health))
        .with_state(state)
}
