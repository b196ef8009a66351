//! Supervised job runners.
//!
//! Each runner polls the queue, leases due jobs one at a time, runs the
//! [`DeliveryWorker`] on each and settles the job: delete it, or push it
//! back with backoff. The pool owns the runner tasks and shuts them down
//! together.

use std::{sync::Arc, time::Duration};

use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use webhooker_core::{models::DeliveryJob, Clock};

use crate::{
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, Result},
    outcome::DeliveryOutcome,
    retry::RetryDecision,
    storage::DeliveryStorage,
    worker::DeliveryWorker,
};

/// Pause after a failed claim before polling again.
const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Pool of job runner tasks.
pub struct WorkerPool {
    storage: Arc<dyn DeliveryStorage>,
    worker: DeliveryWorker,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<JoinHandle<Result<()>>>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    /// Creates a pool. No tasks run until [`WorkerPool::spawn_workers`].
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        worker: DeliveryWorker,
        config: DeliveryConfig,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            storage,
            worker,
            config,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Spawns `worker_count` runners and returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the pool already runs.
    pub async fn spawn_workers(&mut self) -> Result<()> {
        if !self.worker_handles.is_empty() {
            return Err(DeliveryError::configuration("worker pool already started"));
        }

        info!(worker_count = self.config.worker_count, "spawning job runners");

        self.stats.write().await.active_workers = self.config.worker_count;

        for worker_id in 0..self.config.worker_count {
            let runner = self.runner(worker_id);

            let handle = tokio::spawn(async move {
                let result = runner.run().await;

                if let Err(ref error) = result {
                    error!(worker_id, error = %error, "job runner terminated with error");
                } else {
                    info!(worker_id, "job runner stopped gracefully");
                }

                result
            });

            self.worker_handles.push(handle);
        }

        Ok(())
    }

    /// Creates a runner sharing this pool's storage, stats and token.
    pub fn runner(&self, worker_id: usize) -> JobRunner {
        JobRunner {
            id: worker_id,
            storage: self.storage.clone(),
            worker: self.worker.clone(),
            config: self.config.clone(),
            stats: self.stats.clone(),
            cancellation_token: self.cancellation_token.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Cancels all runners and waits for in-flight jobs to settle.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if runners are still busy
    /// after `timeout`.
    pub async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_seconds = timeout.as_secs(),
            "initiating graceful runner shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown_future = async move {
            let mut panicked = 0usize;

            for (worker_id, handle) in handles.into_iter().enumerate() {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(worker_id, error = %error, "runner finished with error");
                    },
                    Err(join_error) => {
                        error!(worker_id, error = %join_error, "runner task panicked");
                        panicked += 1;
                    },
                }
            }

            stats.write().await.active_workers = 0;
            panicked
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(panicked) => {
                if panicked > 0 {
                    warn!(panicked, "some runners panicked before shutdown");
                }
                info!("worker pool shutdown completed");
                Ok(())
            },
            Err(_elapsed) => {
                error!(
                    timeout_seconds = timeout.as_secs(),
                    "runner shutdown timed out, some jobs may still be leased"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Returns true while any runner task is still alive.
    pub fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|h| !h.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count = self.worker_handles.iter().filter(|h| !h.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            error!(
                active_workers = active_count,
                "WorkerPool dropped with active runners, forcing cancellation"
            );
            self.cancellation_token.cancel();
        }
    }
}

/// One polling loop over the job queue.
pub struct JobRunner {
    id: usize,
    storage: Arc<dyn DeliveryStorage>,
    worker: DeliveryWorker,
    config: DeliveryConfig,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl JobRunner {
    /// Polls until cancelled.
    ///
    /// # Errors
    ///
    /// Claim failures are logged and retried, so this currently only
    /// returns `Ok`.
    pub async fn run(&self) -> Result<()> {
        info!(worker_id = self.id, "job runner starting");

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let pause = match self.process_batch().await {
                Ok(0) => self.config.poll_interval,
                Ok(_) => continue,
                Err(error) => {
                    error!(worker_id = self.id, error = %error, "failed to claim jobs");
                    ERROR_BACKOFF
                },
            };

            tokio::select! {
                () = self.clock.sleep(pause) => {},
                () = self.cancellation_token.cancelled() => break,
            }
        }

        info!(worker_id = self.id, "job runner stopped");
        Ok(())
    }

    /// Runs up to `batch_size` due jobs, claiming each one just before it
    /// is delivered.
    ///
    /// A job's lease starts when that job is claimed, so it only has to
    /// cover a single delivery and never the ones queued ahead of it.
    /// Returns the number of jobs claimed.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Database` if claiming fails. Failures while
    /// running or settling individual jobs are logged; their leases expire
    /// and the jobs are claimed again.
    pub async fn process_batch(&self) -> Result<usize> {
        let mut claimed = 0;

        while claimed < self.config.batch_size {
            if claimed > 0 && self.cancellation_token.is_cancelled() {
                break;
            }

            let Some(job) = self.claim_next().await? else {
                break;
            };
            claimed += 1;

            if let Err(error) = self.run_job(&job).await {
                error!(
                    worker_id = self.id,
                    job_id = %job.id,
                    attempt_id = %job.attempt_id,
                    error = %error,
                    "failed to settle job, lease will expire"
                );
            }
        }

        if claimed > 0 {
            debug!(worker_id = self.id, claimed, "processed delivery jobs");
        }

        Ok(claimed)
    }

    async fn claim_next(&self) -> Result<Option<DeliveryJob>> {
        let jobs = self
            .storage
            .claim_due_jobs(self.clock.now_utc(), 1, self.config.job_lease)
            .await
            .map_err(|e| DeliveryError::database(format!("failed to claim due job: {e}")))?;

        Ok(jobs.into_iter().next())
    }

    async fn run_job(&self, job: &DeliveryJob) -> Result<()> {
        self.stats.write().await.in_flight_deliveries += 1;
        let result = self.worker.deliver(job.attempt_id).await;
        {
            let mut stats = self.stats.write().await;
            stats.in_flight_deliveries = stats.in_flight_deliveries.saturating_sub(1);
            stats.jobs_processed += 1;
            match &result {
                Ok(DeliveryOutcome::Delivered { .. }) => stats.successful_deliveries += 1,
                Ok(DeliveryOutcome::Terminal { subscriber_disabled, .. }) => {
                    stats.terminal_failures += 1;
                    if *subscriber_disabled {
                        stats.subscribers_disabled += 1;
                    }
                },
                Ok(DeliveryOutcome::Skipped(_)) => stats.skipped += 1,
                Ok(DeliveryOutcome::Retry { .. }) | Err(_) => {},
            }
        }

        let retry = match &result {
            Ok(outcome) => outcome.should_retry(),
            Err(error) => {
                warn!(
                    worker_id = self.id,
                    attempt_id = %job.attempt_id,
                    error = %error,
                    "delivery errored"
                );
                error.is_retryable()
            },
        };

        if !retry {
            self.storage.complete_job(job.id).await?;
            return Ok(());
        }

        match self.config.retry_schedule.decide(job.attempt_number, self.clock.now_utc()) {
            RetryDecision::Retry { next_attempt_at } => {
                self.storage.reschedule_job(job.id, next_attempt_at).await?;
                self.stats.write().await.retries_scheduled += 1;
                debug!(
                    worker_id = self.id,
                    attempt_id = %job.attempt_id,
                    attempt_number = job.attempt_number,
                    next_attempt_at = %next_attempt_at,
                    "delivery rescheduled"
                );
            },
            RetryDecision::GiveUp { reason } => {
                self.storage.complete_job(job.id).await?;
                self.stats.write().await.jobs_discarded += 1;
                warn!(
                    worker_id = self.id,
                    attempt_id = %job.attempt_id,
                    attempt_number = job.attempt_number,
                    reason = %reason,
                    "discarding delivery job"
                );
            },
        }

        Ok(())
    }
}
