//! HTTP client for webhook callbacks.
//!
//! Sends exactly one POST per call and classifies transport failures into
//! [`TransportErrorKind`]. Non-2xx responses are not errors here; the
//! worker decides what they mean.

use std::{collections::BTreeMap, time::Duration};

use bytes::Bytes;
use reqwest::{header::HeaderMap, Response};
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};
use webhooker_core::{AttemptId, DeliveryAttempt, Subscriber, SubscriberId};

use crate::error::{DeliveryError, Result, TransportErrorKind};

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout covering connect, request and response body.
    pub timeout: Duration,
    /// `User-Agent` sent with every callback.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
    /// Optional cap on stored response bodies. `None` keeps them verbatim.
    pub max_body_bytes: Option<usize>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            user_agent: crate::DEFAULT_USER_AGENT.to_string(),
            max_redirects: 3,
            max_body_bytes: None,
        }
    }
}

/// JSON body POSTed to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundBody {
    /// Receiving subscriber.
    pub subscriber_id: SubscriberId,
    /// URL the callback was sent to.
    pub subscriber_url: String,
    /// Event name.
    pub event: String,
    /// Opaque payload, forwarded unchanged.
    pub payload: serde_json::Value,
}

impl OutboundBody {
    /// Builds the body for delivering `attempt` to `subscriber`.
    pub fn new(attempt: &DeliveryAttempt, subscriber: &Subscriber) -> Self {
        Self {
            subscriber_id: subscriber.id,
            subscriber_url: subscriber.url.clone(),
            event: attempt.event.clone(),
            payload: attempt.payload.as_value().clone(),
        }
    }
}

/// One outbound callback.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Attempt being delivered.
    pub attempt_id: AttemptId,
    /// Destination URL.
    pub url: String,
    /// Serialized JSON body.
    pub body: Bytes,
}

impl DeliveryRequest {
    /// Serializes the callback for `attempt` addressed to `subscriber`.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidInput` if the body cannot be encoded.
    pub fn for_attempt(attempt: &DeliveryAttempt, subscriber: &Subscriber) -> Result<Self> {
        let body = serde_json::to_vec(&OutboundBody::new(attempt, subscriber))
            .map_err(|e| DeliveryError::invalid_input(format!("unencodable payload: {e}")))?;

        Ok(Self { attempt_id: attempt.id, url: subscriber.url.clone(), body: Bytes::from(body) })
    }
}

/// Completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers. Repeated headers are joined with `", "`.
    pub headers: BTreeMap<String, String>,
    /// Response body, lossily decoded. Truncated only when a cap is set.
    pub body: String,
    /// Wall time of the exchange.
    pub duration: Duration,
    /// Whether the status was 2xx.
    pub is_success: bool,
}

/// Client used by every delivery worker.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the underlying HTTP client
    /// cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a client with default configuration.
    ///
    /// # Errors
    ///
    /// See [`DeliveryClient::new`].
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs a callback and returns the response, whatever its status.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Transport` when no response was received.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = std::time::Instant::now();

        let span = info_span!(
            "webhook_post",
            attempt_id = %request.attempt_id,
            url = %request.url,
        );

        async move {
            tracing::debug!(bytes = request.body.len(), "sending webhook");

            let sent = self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(request.body)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(e) => {
                    let kind = classify_error(&e);
                    tracing::warn!(
                        duration_ms = start_time.elapsed().as_millis(),
                        kind = %kind,
                        error = %e,
                        "webhook request failed"
                    );
                    return Err(DeliveryError::transport(kind, error_chain(&e)));
                },
            };

            let delivery_response = self.parse_response(response, start_time).await?;

            tracing::debug!(
                status = delivery_response.status_code,
                duration_ms = delivery_response.duration.as_millis(),
                "received webhook response"
            );

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }

    async fn parse_response(
        &self,
        response: Response,
        start_time: std::time::Instant,
    ) -> Result<DeliveryResponse> {
        let status_code = response.status().as_u16();
        let is_success = response.status().is_success();
        let headers = extract_headers(response.headers());

        let body = match response.bytes().await {
            Ok(bytes) => decode_body(&bytes, self.config.max_body_bytes),
            Err(e) if e.is_timeout() => {
                return Err(DeliveryError::transport(TransportErrorKind::Timeout, error_chain(&e)));
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to read response body");
                format!("[failed to read response body: {e}]")
            },
        };

        Ok(DeliveryResponse {
            status_code,
            headers,
            body,
            duration: start_time.elapsed(),
            is_success,
        })
    }
}

/// Maps a reqwest error onto the transport taxonomy.
///
/// Timeouts win over everything else. TLS is checked before connect
/// because handshake failures also report `is_connect()`. DNS failures
/// surface as connect errors.
fn classify_error(error: &reqwest::Error) -> TransportErrorKind {
    if error.is_timeout() {
        return TransportErrorKind::Timeout;
    }
    if is_tls_failure(error) {
        return TransportErrorKind::Tls;
    }
    if error.is_connect() {
        return TransportErrorKind::Connection;
    }
    TransportErrorKind::Other
}

/// Walks the source chain looking for a `rustls::Error`.
///
/// The TLS stream reports handshake and record failures as an `io::Error`
/// wrapping the rustls error. `io::Error::source` skips its payload, so the
/// payload is inspected through `get_ref`.
fn is_tls_failure(error: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(error);
    while let Some(err) = source {
        if err.is::<rustls::Error>() {
            return true;
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if io.get_ref().is_some_and(|inner| inner.is::<rustls::Error>()) {
                return true;
            }
        }
        source = err.source();
    }
    false
}

fn error_chain(error: &reqwest::Error) -> String {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(error);
    while let Some(err) = source {
        message.push_str(": ");
        message.push_str(&err.to_string());
        source = err.source();
    }
    message
}

/// Flattens response headers into one entry per name.
///
/// Repeated headers are joined in arrival order. Values that are not valid
/// UTF-8 are decoded lossily.
fn extract_headers(header_map: &HeaderMap) -> BTreeMap<String, String> {
    header_map
        .keys()
        .map(|key| {
            let joined = header_map
                .get_all(key)
                .iter()
                .map(|value| String::from_utf8_lossy(value.as_bytes()))
                .collect::<Vec<_>>()
                .join(", ");
            (key.as_str().to_string(), joined)
        })
        .collect()
}

fn decode_body(bytes: &[u8], max_bytes: Option<usize>) -> String {
    match max_bytes {
        Some(max_bytes) if bytes.len() > max_bytes => {
            let truncated = String::from_utf8_lossy(&bytes[..max_bytes]);
            format!("{truncated}... (truncated)")
        },
        _ => String::from_utf8_lossy(bytes).into_owned(),
    }
}
