//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::caps::now;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::matching::ProjectMatching;
use crate::types::{CumulativeCaps, Round};

#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Engine>,
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct AtQuery {
    pub at: Option<i64>,
}

#[derive(Deserialize)]
pub struct CapacityQuery {
    pub user_id: i64,
    pub at: Option<i64>,
}

#[derive(Deserialize)]
pub struct NetworkQuery {
    pub network_id: i64,
    pub at: Option<i64>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ActiveRoundResponse {
    pub at: i64,
    pub round: Option<Round>,
}

#[derive(Serialize)]
pub struct CapsResponse {
    pub round_id: i64,
    #[serde(flatten)]
    pub caps: CumulativeCaps,
}

#[derive(Serialize)]
pub struct DeactivatedResponse {
    pub count: usize,
    pub round_ids: Vec<i64>,
}

#[derive(Serialize)]
pub struct CapacityResponse {
    pub project_id: i64,
    pub user_id: i64,
    pub at: i64,
    pub remaining: f64,
}

#[derive(Serialize)]
pub struct MatchingResponse {
    pub qf_round_id: i64,
    pub count: usize,
    pub projects: Vec<ProjectMatching>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::RoundNotFound(_)
        | EngineError::DonationNotFound(_)
        | EngineError::NoActiveRound(_)
        | EngineError::NoActiveRoundForProject { .. }
        | EngineError::NoEligibleRoundForNetwork { .. } => StatusCode::NOT_FOUND,
        EngineError::CapExceeded { .. } | EngineError::AggregateWriteConflict(_) => {
            StatusCode::CONFLICT
        }
        EngineError::ReputationScoreTooLow { .. }
        | EngineError::ReputationCapExceeded { .. }
        | EngineError::InvalidRound(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::StaleReputationScoreRefreshFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(err: EngineError) -> Response {
    let status = status_for(&err);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("Request failed: {err}");
    }
    (
        status,
        Json(serde_json::json!(ErrorResponse {
            error: err.to_string()
        })),
    )
        .into_response()
}

fn ok<T: Serialize>(body: T) -> Response {
    (StatusCode::OK, Json(serde_json::json!(body))).into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /rounds/active?at=`
///
/// The round active at `at` (defaults to now), or `null`.
pub async fn get_active_round(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<AtQuery>,
) -> Response {
    let at = query.at.unwrap_or_else(now);
    match state.engine.active_round(at).await {
        Ok(round) => ok(ActiveRoundResponse { at, round }),
        Err(e) => error_response(e),
    }
}

/// `GET /rounds/:id/caps`
pub async fn get_round_caps(
    State(state): State<Arc<ApiState>>,
    Path(round_id): Path<i64>,
) -> Response {
    match state.engine.cumulative_caps(round_id).await {
        Ok(caps) => ok(CapsResponse { round_id, caps }),
        Err(e) => error_response(e),
    }
}

/// `POST /rounds/deactivate-expired`
pub async fn deactivate_expired(State(state): State<Arc<ApiState>>) -> Response {
    match state.engine.deactivate_expired_rounds(now()).await {
        Ok(round_ids) => ok(DeactivatedResponse {
            count: round_ids.len(),
            round_ids,
        }),
        Err(e) => error_response(e),
    }
}

/// `GET /projects/:id/capacity?user_id=&at=`
///
/// Remaining donation capacity in token units of the active round.
pub async fn get_capacity(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Query(query): Query<CapacityQuery>,
) -> Response {
    let at = query.at.unwrap_or_else(now);
    match state
        .engine
        .remaining_capacity(project_id, query.user_id, at)
        .await
    {
        Ok(remaining) => ok(CapacityResponse {
            project_id,
            user_id: query.user_id,
            at,
            remaining,
        }),
        Err(e) => error_response(e),
    }
}

/// `GET /projects/:id/qf-round?network_id=`
pub async fn get_qf_round(
    State(state): State<Arc<ApiState>>,
    Path(project_id): Path<i64>,
    Query(query): Query<NetworkQuery>,
) -> Response {
    let at = query.at.unwrap_or_else(now);
    match state
        .engine
        .select_round(query.network_id, project_id, at)
        .await
    {
        Ok(round) => ok(round),
        Err(e) => error_response(e),
    }
}

/// `POST /qf-rounds/:id/matching`
///
/// Recompute and persist the round's matching figures.
pub async fn recompute_matching(
    State(state): State<Arc<ApiState>>,
    Path(qf_round_id): Path<i64>,
) -> Response {
    match state.engine.recompute_matching(qf_round_id).await {
        Ok(projects) => ok(MatchingResponse {
            qf_round_id,
            count: projects.len(),
            projects,
        }),
        Err(e) => error_response(e),
    }
}

/// `GET /qf-rounds/:id/matching`
pub async fn get_matching(
    State(state): State<Arc<ApiState>>,
    Path(qf_round_id): Path<i64>,
) -> Response {
    match state.engine.matching_for(qf_round_id).await {
        Ok(projects) => ok(MatchingResponse {
            qf_round_id,
            count: projects.len(),
            projects,
        }),
        Err(e) => error_response(e),
    }
}
