//! Delivery of a single attempt.
//!
//! Every execution re-reads the attempt and its subscriber, so a subscriber
//! disabled or unsubscribed while a retry was pending is never contacted
//! again. The worker posts once, records what it saw on the attempt, may
//! disable the subscriber, and returns a [`DeliveryOutcome`] whose only
//! retry-relevant bit is [`DeliveryOutcome::should_retry`].

use std::sync::Arc;

use tracing::{debug, info, instrument, warn, Span};
use webhooker_core::models::{
    AttemptId, AttemptResponse, DeliveryAttempt, Subscriber, TransportFailure,
};

use crate::{
    client::{DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::{DeliveryError, Result, TransportErrorKind},
    outcome::{DeliveryOutcome, SkipReason, TerminalReason},
    storage::DeliveryStorage,
    tunnel::{FailureAction, TunnelDetector},
};

/// Performs one HTTP delivery for one attempt.
#[derive(Clone)]
pub struct DeliveryWorker {
    storage: Arc<dyn DeliveryStorage>,
    client: Arc<DeliveryClient>,
    tunnel: Arc<dyn TunnelDetector>,
}

impl DeliveryWorker {
    /// Creates a worker.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        client: Arc<DeliveryClient>,
        tunnel: Arc<dyn TunnelDetector>,
    ) -> Self {
        Self { storage, client, tunnel }
    }

    /// Delivers `attempt_id` to its subscriber.
    ///
    /// Missing records and ineligible subscribers are no-ops. Transport
    /// failures and non-2xx responses are recorded on the attempt before
    /// returning.
    ///
    /// # Errors
    ///
    /// Returns an error only when storage fails; callers treat that like a
    /// retry signal.
    #[instrument(
        name = "deliver",
        skip_all,
        fields(attempt_id = %attempt_id, subscriber_id = tracing::field::Empty)
    )]
    pub async fn deliver(&self, attempt_id: AttemptId) -> Result<DeliveryOutcome> {
        let Some(attempt) = self.storage.find_attempt(attempt_id).await? else {
            debug!("attempt no longer exists, skipping");
            return Ok(DeliveryOutcome::Skipped(SkipReason::AttemptMissing));
        };
        Span::current().record("subscriber_id", tracing::field::display(attempt.subscriber_id));

        let Some(subscriber) = self.storage.find_subscriber(attempt.subscriber_id).await? else {
            debug!("subscriber no longer exists, skipping");
            return Ok(DeliveryOutcome::Skipped(SkipReason::SubscriberMissing));
        };

        if !subscriber.enabled {
            debug!("subscriber disabled, skipping");
            return Ok(DeliveryOutcome::Skipped(SkipReason::SubscriberDisabled));
        }
        if !subscriber.is_subscribed(&attempt.event) {
            debug!(event = %attempt.event, "subscriber no longer listens to event, skipping");
            return Ok(DeliveryOutcome::Skipped(SkipReason::NotSubscribed));
        }

        let request = DeliveryRequest::for_attempt(&attempt, &subscriber)?;

        match self.client.deliver(request).await {
            Ok(response) => self.handle_response(&attempt, &subscriber, response).await,
            Err(DeliveryError::Transport { kind, message }) => {
                self.handle_transport_failure(&attempt, &subscriber, kind, &message).await
            },
            Err(other) => Err(other),
        }
    }

    async fn handle_transport_failure(
        &self,
        attempt: &DeliveryAttempt,
        subscriber: &Subscriber,
        kind: TransportErrorKind,
        message: &str,
    ) -> Result<DeliveryOutcome> {
        let Some(failure) = kind.failure() else {
            warn!(error = %message, "unclassified transport failure, will retry");
            return Ok(DeliveryOutcome::Retry { reason: format!("transport error: {message}") });
        };

        self.storage
            .record_response(attempt.id, AttemptResponse::Failed { error: failure })
            .await?;

        let (reason, subscriber_disabled) = match failure {
            TransportFailure::Tls => (TerminalReason::Tls, false),
            TransportFailure::Timeout => (TerminalReason::Timeout, false),
            TransportFailure::Connection => {
                (TerminalReason::Connection, self.disable(subscriber).await?)
            },
        };

        warn!(
            failure = %failure,
            subscriber_disabled,
            error = %message,
            "delivery failed, not retrying"
        );

        Ok(DeliveryOutcome::Terminal { reason, subscriber_disabled })
    }

    async fn handle_response(
        &self,
        attempt: &DeliveryAttempt,
        subscriber: &Subscriber,
        response: DeliveryResponse,
    ) -> Result<DeliveryOutcome> {
        let status = response.status_code;
        let action = if response.is_success {
            None
        } else {
            Some(self.tunnel.failure_action(&subscriber.url, status, &response.body))
        };

        self.storage
            .record_response(
                attempt.id,
                AttemptResponse::Received {
                    headers: response.headers,
                    code: status,
                    body: response.body,
                },
            )
            .await?;

        match action {
            None => {
                info!(status, duration_ms = response.duration.as_millis(), "webhook delivered");
                Ok(DeliveryOutcome::Delivered { status })
            },
            Some(FailureAction::Retry) => {
                info!(status, "subscriber returned failure status, will retry");
                Ok(DeliveryOutcome::Retry { reason: format!("HTTP {status}") })
            },
            Some(FailureAction::Disable(reason)) => {
                let subscriber_disabled = self.disable(subscriber).await?;
                warn!(status, %reason, subscriber_disabled, "tunnel endpoint is gone");
                Ok(DeliveryOutcome::Terminal { reason, subscriber_disabled })
            },
        }
    }

    async fn disable(&self, subscriber: &Subscriber) -> Result<bool> {
        let changed = self.storage.disable_subscriber(subscriber.id).await?;
        if changed {
            warn!(url = %subscriber.url, "subscriber disabled");
        }
        Ok(changed)
    }
}
