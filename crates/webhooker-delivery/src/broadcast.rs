//! Fan-out of one event to every interested subscriber.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, instrument};
use webhooker_core::{
    models::{validate_event_name, AttemptId, DeliveryAttempt, DeliveryJob, JobId, Payload},
    Clock,
};

use crate::{
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
};

/// What a broadcast produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Event name that was broadcast.
    pub event: String,
    /// Number of enabled subscribers that matched.
    pub matched: usize,
    /// Attempts with a queued delivery job, in registry order.
    pub enqueued: Vec<AttemptId>,
    /// Attempts persisted without a job; they need a manual replay.
    pub unqueued: Vec<AttemptId>,
}

/// Materializes delivery attempts and enqueues their jobs.
///
/// Makes no HTTP calls.
pub struct Broadcaster {
    storage: Arc<dyn DeliveryStorage>,
    clock: Arc<dyn Clock>,
}

impl Broadcaster {
    /// Creates a broadcaster over the given storage.
    pub fn new(storage: Arc<dyn DeliveryStorage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Creates one attempt and one job per enabled subscriber listening to
    /// `event`.
    ///
    /// A failed enqueue does not abort the fan-out: the attempt stays
    /// persisted and is listed in [`BroadcastReport::unqueued`].
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::InvalidInput` for a blank event name or an
    /// empty payload, and a storage error if subscribers cannot be listed
    /// or an attempt cannot be created.
    #[instrument(skip(self, payload), fields(event = %event))]
    pub async fn broadcast(
        &self,
        event: &str,
        payload: serde_json::Value,
    ) -> Result<BroadcastReport> {
        validate_event_name(event)?;
        let payload = Payload::new(payload)?;

        let subscribers = self.storage.find_enabled_subscribers().await?;
        let mut report = BroadcastReport {
            event: event.to_string(),
            matched: 0,
            enqueued: Vec::new(),
            unqueued: Vec::new(),
        };

        for subscriber in subscribers.iter().filter(|s| s.is_eligible(event)) {
            report.matched += 1;

            let now = self.clock.now_utc();
            let attempt = DeliveryAttempt::new(subscriber.id, event, payload.clone(), now)?;
            let attempt_id = self.storage.create_attempt(attempt).await?;

            match self.storage.enqueue_job(DeliveryJob::new(attempt_id, now)).await {
                Ok(job_id) => {
                    debug!(
                        attempt_id = %attempt_id,
                        subscriber_id = %subscriber.id,
                        job_id = %job_id,
                        "delivery queued"
                    );
                    report.enqueued.push(attempt_id);
                },
                Err(e) => {
                    error!(
                        attempt_id = %attempt_id,
                        subscriber_id = %subscriber.id,
                        error = %e,
                        "failed to enqueue delivery, attempt needs replay"
                    );
                    report.unqueued.push(attempt_id);
                },
            }
        }

        info!(
            matched = report.matched,
            enqueued = report.enqueued.len(),
            unqueued = report.unqueued.len(),
            "event broadcast"
        );

        Ok(report)
    }

    /// Queues a fresh delivery job for an existing attempt.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::NotFound` if the attempt does not exist.
    #[instrument(skip(self), fields(attempt_id = %attempt_id))]
    pub async fn replay(&self, attempt_id: AttemptId) -> Result<JobId> {
        if self.storage.find_attempt(attempt_id).await?.is_none() {
            return Err(DeliveryError::not_found(format!("delivery attempt {attempt_id}")));
        }

        let job_id =
            self.storage.enqueue_job(DeliveryJob::new(attempt_id, self.clock.now_utc())).await?;
        info!(job_id = %job_id, "delivery replay queued");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use webhooker_core::{NewSubscriber, TestClock};

    use super::*;
    use crate::storage::mock::MockDeliveryStorage;

    fn broadcaster(storage: &MockDeliveryStorage) -> Broadcaster {
        Broadcaster::new(Arc::new(storage.clone()), Arc::new(TestClock::new()))
    }

    #[tokio::test]
    async fn blank_event_rejected_before_storage() {
        let storage = MockDeliveryStorage::new();
        let err = broadcaster(&storage).broadcast("  ", json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, DeliveryError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn empty_payload_rejected() {
        let storage = MockDeliveryStorage::new();
        let b = broadcaster(&storage);
        assert!(b.broadcast("user.created", json!(null)).await.is_err());
        assert!(b.broadcast("user.created", json!("")).await.is_err());
    }

    #[tokio::test]
    async fn replay_of_unknown_attempt_is_not_found() {
        let storage = MockDeliveryStorage::new();
        let err = broadcaster(&storage).replay(AttemptId::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::NotFound { .. }));
        assert!(storage.jobs().await.is_empty());
    }

    #[tokio::test]
    async fn replay_enqueues_new_job() {
        let storage = MockDeliveryStorage::new();
        let subscriber = NewSubscriber::new("https://hooks.example.com/in")
            .into_subscriber(chrono::Utc::now())
            .unwrap();
        let attempt = DeliveryAttempt::new(
            subscriber.id,
            "user.created",
            Payload::new(json!({"id": 1})).unwrap(),
            chrono::Utc::now(),
        )
        .unwrap();
        let attempt_id = attempt.id;
        storage.add_subscriber(subscriber).await;
        storage.add_attempt(attempt).await;

        broadcaster(&storage).replay(attempt_id).await.unwrap();

        let jobs = storage.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempt_id, attempt_id);
        assert_eq!(jobs[0].attempt_number, 0);
    }
}
