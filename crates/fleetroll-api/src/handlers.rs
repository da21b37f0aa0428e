//! REST API handlers.
//!
//! Reads go straight to the store or manager. Rollout creation and group
//! validation count targets through the matcher, so they run on the
//! blocking pool.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleetroll_rollout::{CreateRollout, GroupLayout, MatchError, RolloutError};
use fleetroll_state::*;
use serde::Deserialize;
use tracing::{error, info};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn status_for(e: &RolloutError) -> StatusCode {
    match e {
        RolloutError::Validation(_) | RolloutError::Matcher(MatchError::InvalidQuery { .. }) => {
            StatusCode::BAD_REQUEST
        }
        RolloutError::IllegalState(_) | RolloutError::State(StateError::Conflict(_)) => {
            StatusCode::CONFLICT
        }
        RolloutError::RolloutNotFound(_)
        | RolloutError::GroupNotFound(_)
        | RolloutError::DistributionNotFound(_)
        | RolloutError::State(StateError::NotFound { .. }) => StatusCode::NOT_FOUND,
        RolloutError::Matcher(MatchError::Store(_)) | RolloutError::State(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn rollout_error(e: RolloutError) -> Response {
    let status = status_for(&e);
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "request failed");
    }
    error_response(&e.to_string(), status)
}

fn state_error(e: StateError) -> Response {
    rollout_error(RolloutError::State(e))
}

fn respond<T: serde::Serialize>(result: Result<T, RolloutError>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// Run a synchronous engine call on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR))
}

// ── Rollouts ───────────────────────────────────────────────────

/// GET /api/v1/rollouts
pub async fn list_rollouts(State(state): State<ApiState>) -> Response {
    respond(state.manager.list_rollouts())
}

/// POST /api/v1/rollouts
pub async fn create_rollout(
    State(state): State<ApiState>,
    Json(req): Json<CreateRollout>,
) -> Response {
    let manager = state.manager.clone();
    match blocking(move || manager.create_rollout(req)).await {
        Ok(Ok(rollout)) => {
            info!(rollout = rollout.id, name = %rollout.name, "rollout created via api");
            (StatusCode::CREATED, ApiResponse::ok(rollout)).into_response()
        }
        Ok(Err(e)) => rollout_error(e),
        Err(response) => response,
    }
}

/// Body of POST /api/v1/rollouts/validate.
#[derive(Deserialize)]
pub struct ValidateRequest {
    pub target_filter: String,
    pub groups: GroupLayout,
}

/// POST /api/v1/rollouts/validate
pub async fn validate_groups(
    State(state): State<ApiState>,
    Json(req): Json<ValidateRequest>,
) -> Response {
    let manager = state.manager.clone();
    match blocking(move || manager.validate_groups(&req.target_filter, &req.groups)).await {
        Ok(result) => respond(result),
        Err(response) => response,
    }
}

/// GET /api/v1/rollouts/:id
pub async fn get_rollout(State(state): State<ApiState>, Path(id): Path<RolloutId>) -> Response {
    respond(state.manager.get_rollout(id))
}

/// GET /api/v1/rollouts/:id/groups
pub async fn list_groups(State(state): State<ApiState>, Path(id): Path<RolloutId>) -> Response {
    respond(state.manager.groups(id))
}

/// GET /api/v1/rollouts/:id/progress
pub async fn get_progress(State(state): State<ApiState>, Path(id): Path<RolloutId>) -> Response {
    respond(state.manager.progress(id))
}

/// POST /api/v1/rollouts/:id/start
pub async fn start_rollout(State(state): State<ApiState>, Path(id): Path<RolloutId>) -> Response {
    respond(state.manager.start(id))
}

/// POST /api/v1/rollouts/:id/pause
pub async fn pause_rollout(State(state): State<ApiState>, Path(id): Path<RolloutId>) -> Response {
    respond(state.manager.pause(id))
}

/// POST /api/v1/rollouts/:id/resume
pub async fn resume_rollout(State(state): State<ApiState>, Path(id): Path<RolloutId>) -> Response {
    respond(state.manager.resume(id))
}

// ── Targets ────────────────────────────────────────────────────

/// Body of POST /api/v1/targets.
#[derive(Deserialize)]
pub struct RegisterTarget {
    pub id: TargetId,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// GET /api/v1/targets
pub async fn list_targets(State(state): State<ApiState>) -> Response {
    match state.store.list_targets() {
        Ok(targets) => ApiResponse::ok(targets).into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/targets
pub async fn put_target(
    State(state): State<ApiState>,
    Json(req): Json<RegisterTarget>,
) -> Response {
    if req.id.trim().is_empty() {
        return error_response("target id must not be blank", StatusCode::BAD_REQUEST);
    }
    let mut target = Target::new(req.id);
    target.attributes = req.attributes;
    match state.store.put_target(&target) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(target)).into_response(),
        Err(e) => state_error(e),
    }
}

/// DELETE /api/v1/targets/:id
pub async fn delete_target(State(state): State<ApiState>, Path(id): Path<TargetId>) -> Response {
    match state.store.delete_target(&id) {
        Ok(true) => ApiResponse::ok("deleted").into_response(),
        Ok(false) => error_response("target not found", StatusCode::NOT_FOUND),
        Err(e) => state_error(e),
    }
}

// ── Distributions ──────────────────────────────────────────────

/// Body of POST /api/v1/distributions.
#[derive(Deserialize)]
pub struct CreateDistribution {
    pub name: String,
    pub version: String,
}

/// GET /api/v1/distributions
pub async fn list_distributions(State(state): State<ApiState>) -> Response {
    match state.store.list_distributions() {
        Ok(distributions) => ApiResponse::ok(distributions).into_response(),
        Err(e) => state_error(e),
    }
}

/// POST /api/v1/distributions
pub async fn create_distribution(
    State(state): State<ApiState>,
    Json(req): Json<CreateDistribution>,
) -> Response {
    if req.name.trim().is_empty() || req.version.trim().is_empty() {
        return error_response(
            "distribution name and version must not be blank",
            StatusCode::BAD_REQUEST,
        );
    }
    match state.store.create_distribution(&req.name, &req.version) {
        Ok(distribution) => (StatusCode::CREATED, ApiResponse::ok(distribution)).into_response(),
        Err(e) => state_error(e),
    }
}

// ── Actions ────────────────────────────────────────────────────

/// Body of PUT /api/v1/actions/:id/status.
#[derive(Deserialize)]
pub struct ActionStatusReport {
    pub status: ActionStatus,
}

/// PUT /api/v1/actions/:id/status
pub async fn update_action_status(
    State(state): State<ApiState>,
    Path(id): Path<ActionId>,
    Json(req): Json<ActionStatusReport>,
) -> Response {
    match state.store.update_action_status(id, req.status) {
        Ok(action) => ApiResponse::ok(action).into_response(),
        Err(e) => state_error(e),
    }
}
