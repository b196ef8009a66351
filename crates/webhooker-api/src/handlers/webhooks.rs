//! Development receiver for delivered webhooks.
//!
//! Point a subscriber at `/api/v1/webhooks` on a local instance to watch
//! deliveries arrive. The handler logs the callback and echoes its
//! `payload` back.

use axum::Json;
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument};

/// Callback body as POSTed by the delivery worker.
///
/// Every field is optional so hand-written test requests are accepted.
#[derive(Debug, Deserialize)]
pub struct ReceivedWebhook {
    /// Sending subscriber's id
    #[serde(default)]
    pub subscriber_id: Option<String>,
    /// Event name
    #[serde(default)]
    pub event: Option<String>,
    /// Delivered payload
    #[serde(default)]
    pub payload: Value,
}

/// Echoes the `payload` of a received webhook.
#[instrument(name = "receive_webhook", skip_all)]
pub async fn receive_webhook(Json(webhook): Json<ReceivedWebhook>) -> Json<Value> {
    info!(
        subscriber_id = webhook.subscriber_id.as_deref().unwrap_or("unknown"),
        event = webhook.event.as_deref().unwrap_or("unknown"),
        "webhook received"
    );

    Json(webhook.payload)
}
