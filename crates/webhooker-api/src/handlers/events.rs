//! Event trigger and manual replay.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use webhooker_core::models::{AttemptId, JobId};

use super::error_response;
use crate::AppState;

/// Body of `POST /api/v1/events`.
#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    /// Event name, e.g. `user.created`.
    pub event: String,
    /// Opaque payload forwarded to every subscriber.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Body returned by a successful replay.
#[derive(Debug, Serialize)]
pub struct ReplayResponse {
    /// Replayed attempt
    pub attempt_id: AttemptId,
    /// Newly queued job
    pub job_id: JobId,
}

/// Broadcasts an event to every interested subscriber.
///
/// Responds `202 Accepted` with the broadcast report once attempts are
/// stored and jobs are queued. Delivery happens asynchronously.
#[instrument(name = "broadcast_event", skip(state, request), fields(event = %request.event))]
pub async fn broadcast_event(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Response {
    match state.broadcaster.broadcast(&request.event, request.payload).await {
        Ok(report) => {
            if !report.unqueued.is_empty() {
                warn!(unqueued = report.unqueued.len(), "broadcast left attempts without a job");
            }
            (StatusCode::ACCEPTED, Json(report)).into_response()
        },
        Err(e) => {
            warn!(error = %e, "broadcast rejected");
            error_response(&e)
        },
    }
}

/// Queues a fresh delivery job for a stored attempt.
#[instrument(name = "replay_attempt", skip(state))]
pub async fn replay_attempt(
    State(state): State<AppState>,
    Path(attempt_id): Path<Uuid>,
) -> Response {
    let attempt_id = AttemptId::from(attempt_id);

    match state.broadcaster.replay(attempt_id).await {
        Ok(job_id) => {
            info!(attempt_id = %attempt_id, job_id = %job_id, "replay accepted");
            (StatusCode::ACCEPTED, Json(ReplayResponse { attempt_id, job_id })).into_response()
        },
        Err(e) => error_response(&e),
    }
}
