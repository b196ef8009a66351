//! HTTP request handlers.
//!
//! - `health` - liveness, readiness and health probes
//! - `events` - event broadcast and attempt replay
//! - `webhooks` - development receiver for delivered callbacks
//!
//! Failures are returned as `{"error": {"code", "message"}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use webhooker_delivery::DeliveryError;

pub mod events;
pub mod health;
pub mod webhooks;

pub use events::{broadcast_event, replay_attempt};
pub use health::{health_check, liveness_check, readiness_check};
pub use webhooks::receive_webhook;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details
    pub error: ErrorDetail,
}

/// Machine-readable code plus message.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

fn status_and_code(error: &DeliveryError) -> (StatusCode, &'static str) {
    match error {
        DeliveryError::InvalidInput { .. } => (StatusCode::UNPROCESSABLE_ENTITY, "invalid_input"),
        DeliveryError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
        DeliveryError::Database { .. } => (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable"),
        DeliveryError::Transport { .. }
        | DeliveryError::Configuration { .. }
        | DeliveryError::ShutdownTimeout { .. } => {
            (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
        },
    }
}

pub(crate) fn error_response(error: &DeliveryError) -> Response {
    let (status, code) = status_and_code(error);
    let body = ErrorResponse {
        error: ErrorDetail { code: code.to_string(), message: error.to_string() },
    };

    (status, Json(body)).into_response()
}
