//! Storage seam for the delivery pipeline.
//!
//! The broadcaster, worker and job runners only talk to [`DeliveryStorage`].
//! Production wraps `webhooker_core::storage::Storage`; tests use the
//! in-memory [`mock::MockDeliveryStorage`] so delivery logic can be
//! exercised against real HTTP servers without a database.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use webhooker_core::{
    error::Result,
    models::{
        AttemptId, AttemptResponse, DeliveryAttempt, DeliveryJob, JobId, Subscriber, SubscriberId,
    },
};

/// Boxed future returned by every storage operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Storage operations required by the delivery pipeline.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Loads an attempt, `None` if it was never created or has been removed.
    fn find_attempt(&self, id: AttemptId) -> StorageFuture<'_, Option<DeliveryAttempt>>;

    /// Loads a subscriber's current state.
    fn find_subscriber(&self, id: SubscriberId) -> StorageFuture<'_, Option<Subscriber>>;

    /// Returns enabled subscribers in registration order.
    fn find_enabled_subscribers(&self) -> StorageFuture<'_, Vec<Subscriber>>;

    /// Persists a new attempt.
    fn create_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, AttemptId>;

    /// Overwrites an attempt's last outcome.
    fn record_response(
        &self,
        id: AttemptId,
        response: AttemptResponse,
    ) -> StorageFuture<'_, ()>;

    /// Disables a subscriber. Returns `true` only if this call changed it.
    fn disable_subscriber(&self, id: SubscriberId) -> StorageFuture<'_, bool>;

    /// Adds a job to the queue.
    fn enqueue_job(&self, job: DeliveryJob) -> StorageFuture<'_, JobId>;

    /// Leases up to `batch_size` due jobs until `now + lease`.
    ///
    /// Returned jobs carry the number of the execution about to start.
    fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        lease: Duration,
    ) -> StorageFuture<'_, Vec<DeliveryJob>>;

    /// Releases a job and makes it due again at `run_at`.
    fn reschedule_job(&self, id: JobId, run_at: DateTime<Utc>) -> StorageFuture<'_, ()>;

    /// Removes a job from the queue.
    fn complete_job(&self, id: JobId) -> StorageFuture<'_, ()>;

    /// Checks the backing store is reachable.
    fn health_check(&self) -> StorageFuture<'_, ()>;
}

/// Production storage backed by PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<webhooker_core::storage::Storage>,
}

impl PostgresDeliveryStorage {
    /// Creates a new PostgreSQL storage adapter.
    pub fn new(storage: Arc<webhooker_core::storage::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_attempt(&self, id: AttemptId) -> StorageFuture<'_, Option<DeliveryAttempt>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.find_by_id(id).await })
    }

    fn find_subscriber(&self, id: SubscriberId) -> StorageFuture<'_, Option<Subscriber>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscribers.find_by_id(id).await })
    }

    fn find_enabled_subscribers(&self) -> StorageFuture<'_, Vec<Subscriber>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscribers.find_enabled().await })
    }

    fn create_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, AttemptId> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.create(&attempt).await })
    }

    fn record_response(
        &self,
        id: AttemptId,
        response: AttemptResponse,
    ) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_attempts.record_response(id, &response).await })
    }

    fn disable_subscriber(&self, id: SubscriberId) -> StorageFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.subscribers.disable(id).await })
    }

    fn enqueue_job(&self, job: DeliveryJob) -> StorageFuture<'_, JobId> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.enqueue(&job).await })
    }

    fn claim_due_jobs(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        lease: Duration,
    ) -> StorageFuture<'_, Vec<DeliveryJob>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.claim_due(now, batch_size, lease).await })
    }

    fn reschedule_job(&self, id: JobId, run_at: DateTime<Utc>) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.reschedule(id, run_at).await })
    }

    fn complete_job(&self, id: JobId) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.delivery_jobs.complete(id).await })
    }

    fn health_check(&self) -> StorageFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.health_check().await })
    }
}

pub mod mock {
    //! In-memory storage for tests.
    //!
    //! Behaves like the PostgreSQL adapter for everything the pipeline
    //! observes: conditional disable, lease-aware claiming, overwrite-only
    //! responses. Every outcome written is also kept in a per-attempt
    //! history so tests can assert on what each execution recorded.

    use std::{collections::HashMap, sync::Arc, time::Duration};

    use chrono::{DateTime, Utc};
    use tokio::sync::RwLock;
    use webhooker_core::error::CoreError;

    use super::{
        AttemptId, AttemptResponse, DeliveryAttempt, DeliveryJob, DeliveryStorage, JobId,
        StorageFuture, Subscriber, SubscriberId,
    };

    /// Mock storage for testing delivery logic without a database.
    #[derive(Clone, Default)]
    pub struct MockDeliveryStorage {
        subscribers: Arc<RwLock<Vec<Subscriber>>>,
        attempts: Arc<RwLock<Vec<DeliveryAttempt>>>,
        responses: Arc<RwLock<HashMap<AttemptId, Vec<AttemptResponse>>>>,
        jobs: Arc<RwLock<HashMap<JobId, DeliveryJob>>>,
        disable_calls: Arc<RwLock<u32>>,
        enqueue_failures: Arc<RwLock<u32>>,
        record_failures: Arc<RwLock<u32>>,
        unhealthy: Arc<RwLock<bool>>,
    }

    impl MockDeliveryStorage {
        /// Creates empty storage.
        pub fn new() -> Self {
            Self::default()
        }

        /// Registers a subscriber. Registration order is preserved.
        pub async fn add_subscriber(&self, subscriber: Subscriber) {
            self.subscribers.write().await.push(subscriber);
        }

        /// Inserts an attempt directly, bypassing the broadcaster.
        pub async fn add_attempt(&self, attempt: DeliveryAttempt) {
            self.attempts.write().await.push(attempt);
        }

        /// Removes a subscriber, simulating deletion by the management surface.
        pub async fn remove_subscriber(&self, id: SubscriberId) {
            self.subscribers.write().await.retain(|s| s.id != id);
        }

        /// Flips a subscriber's enabled flag without counting as a disable call.
        pub async fn set_enabled(&self, id: SubscriberId, enabled: bool) {
            if let Some(s) = self.subscribers.write().await.iter_mut().find(|s| s.id == id) {
                s.enabled = enabled;
            }
        }

        /// Makes the next `count` enqueue calls fail.
        pub async fn fail_next_enqueues(&self, count: u32) {
            *self.enqueue_failures.write().await = count;
        }

        /// Makes the next `count` record calls fail.
        pub async fn fail_next_records(&self, count: u32) {
            *self.record_failures.write().await = count;
        }

        /// Makes health checks fail until reset.
        pub async fn set_unhealthy(&self, unhealthy: bool) {
            *self.unhealthy.write().await = unhealthy;
        }

        /// Returns a subscriber's current state.
        pub async fn subscriber(&self, id: SubscriberId) -> Option<Subscriber> {
            self.subscribers.read().await.iter().find(|s| s.id == id).cloned()
        }

        /// Returns an attempt's current state.
        pub async fn attempt(&self, id: AttemptId) -> Option<DeliveryAttempt> {
            self.attempts.read().await.iter().find(|a| a.id == id).cloned()
        }

        /// Returns every attempt in creation order.
        pub async fn attempts(&self) -> Vec<DeliveryAttempt> {
            self.attempts.read().await.clone()
        }

        /// Returns every outcome recorded for an attempt, oldest first.
        pub async fn response_history(&self, id: AttemptId) -> Vec<AttemptResponse> {
            self.responses.read().await.get(&id).cloned().unwrap_or_default()
        }

        /// Returns queued jobs ordered by `run_at`.
        pub async fn jobs(&self) -> Vec<DeliveryJob> {
            let mut jobs: Vec<DeliveryJob> = self.jobs.read().await.values().cloned().collect();
            jobs.sort_by_key(|j| (j.run_at, j.created_at));
            jobs
        }

        /// Number of disable calls that actually changed a subscriber.
        pub async fn disable_count(&self) -> u32 {
            *self.disable_calls.read().await
        }
    }

    async fn take_failure(counter: &RwLock<u32>) -> bool {
        let mut remaining = counter.write().await;
        if *remaining > 0 {
            *remaining -= 1;
            true
        } else {
            false
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_attempt(&self, id: AttemptId) -> StorageFuture<'_, Option<DeliveryAttempt>> {
            Box::pin(async move { Ok(self.attempt(id).await) })
        }

        fn find_subscriber(&self, id: SubscriberId) -> StorageFuture<'_, Option<Subscriber>> {
            Box::pin(async move { Ok(self.subscriber(id).await) })
        }

        fn find_enabled_subscribers(&self) -> StorageFuture<'_, Vec<Subscriber>> {
            Box::pin(async move {
                Ok(self.subscribers.read().await.iter().filter(|s| s.enabled).cloned().collect())
            })
        }

        fn create_attempt(&self, attempt: DeliveryAttempt) -> StorageFuture<'_, AttemptId> {
            Box::pin(async move {
                if self.subscriber(attempt.subscriber_id).await.is_none() {
                    return Err(CoreError::ConstraintViolation(format!(
                        "subscriber {} does not exist",
                        attempt.subscriber_id
                    )));
                }
                let id = attempt.id;
                self.attempts.write().await.push(attempt);
                Ok(id)
            })
        }

        fn record_response(
            &self,
            id: AttemptId,
            response: AttemptResponse,
        ) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if take_failure(&self.record_failures).await {
                    return Err(CoreError::Database("injected record failure".to_string()));
                }

                let mut attempts = self.attempts.write().await;
                let Some(attempt) = attempts.iter_mut().find(|a| a.id == id) else {
                    return Err(CoreError::NotFound(format!("delivery attempt {id} not found")));
                };
                attempt.response = Some(response.clone());
                attempt.updated_at = Utc::now();
                drop(attempts);

                self.responses.write().await.entry(id).or_default().push(response);
                Ok(())
            })
        }

        fn disable_subscriber(&self, id: SubscriberId) -> StorageFuture<'_, bool> {
            Box::pin(async move {
                let mut subscribers = self.subscribers.write().await;
                let Some(subscriber) = subscribers.iter_mut().find(|s| s.id == id && s.enabled)
                else {
                    return Ok(false);
                };
                subscriber.enabled = false;
                drop(subscribers);

                *self.disable_calls.write().await += 1;
                Ok(true)
            })
        }

        fn enqueue_job(&self, job: DeliveryJob) -> StorageFuture<'_, JobId> {
            Box::pin(async move {
                if take_failure(&self.enqueue_failures).await {
                    return Err(CoreError::Database("injected enqueue failure".to_string()));
                }
                let id = job.id;
                self.jobs.write().await.insert(id, job);
                Ok(id)
            })
        }

        fn claim_due_jobs(
            &self,
            now: DateTime<Utc>,
            batch_size: usize,
            lease: Duration,
        ) -> StorageFuture<'_, Vec<DeliveryJob>> {
            Box::pin(async move {
                let lease = chrono::Duration::from_std(lease)
                    .map_err(|_| CoreError::invalid("job lease out of range"))?;

                let mut jobs = self.jobs.write().await;
                let mut due: Vec<&mut DeliveryJob> = jobs
                    .values_mut()
                    .filter(|j| j.run_at <= now && j.locked_until.is_none_or(|until| until <= now))
                    .collect();
                due.sort_by_key(|j| (j.run_at, j.created_at));

                let claimed: Vec<DeliveryJob> = due
                    .into_iter()
                    .take(batch_size)
                    .map(|job| {
                        job.locked_until = Some(now + lease);
                        job.attempt_number += 1;
                        job.clone()
                    })
                    .collect();

                Ok(claimed)
            })
        }

        fn reschedule_job(&self, id: JobId, run_at: DateTime<Utc>) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                let mut jobs = self.jobs.write().await;
                let job = jobs
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery job {id} not found")))?;
                job.run_at = run_at;
                job.locked_until = None;
                Ok(())
            })
        }

        fn complete_job(&self, id: JobId) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                self.jobs.write().await.remove(&id);
                Ok(())
            })
        }

        fn health_check(&self) -> StorageFuture<'_, ()> {
            Box::pin(async move {
                if *self.unhealthy.read().await {
                    return Err(CoreError::Database("connection refused".to_string()));
                }
                Ok(())
            })
        }
    }
}
