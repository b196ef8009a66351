//! Delivery engine wiring.
//!
//! Owns the HTTP client, tunnel policy, broadcaster and worker pool, and
//! exposes the start / shutdown lifecycle used by the server binary.

use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::info;
use webhooker_core::{storage::Storage, Clock};

use crate::{
    broadcast::Broadcaster,
    client::{ClientConfig, DeliveryClient},
    error::{DeliveryError, Result},
    retry::RetrySchedule,
    storage::{DeliveryStorage, PostgresDeliveryStorage},
    tunnel::{HostSuffixTunnelDetector, TunnelDetector, NGROK_SUFFIX},
    worker::DeliveryWorker,
    worker_pool::WorkerPool,
};

/// Configuration for the delivery engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Number of concurrent job runners.
    pub worker_count: usize,

    /// Maximum jobs a runner works through per poll.
    pub batch_size: usize,

    /// How often idle runners poll for due jobs.
    pub poll_interval: Duration,

    /// How long a claimed job stays invisible to other runners.
    ///
    /// Runners lease one job at a time right before delivering it, so the
    /// lease must exceed the HTTP timeout plus the time to record and settle
    /// the result.
    pub job_lease: Duration,

    /// HTTP client configuration.
    pub client_config: ClientConfig,

    /// Backoff applied to failed deliveries.
    pub retry_schedule: RetrySchedule,

    /// Host suffixes treated as ephemeral tunnels.
    pub tunnel_suffixes: Vec<String>,

    /// Maximum time to wait for runners on shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            worker_count: crate::DEFAULT_WORKER_COUNT,
            batch_size: crate::DEFAULT_BATCH_SIZE,
            poll_interval: Duration::from_secs(1),
            job_lease: Duration::from_secs(300),
            client_config: ClientConfig::default(),
            retry_schedule: RetrySchedule::default(),
            tunnel_suffixes: vec![NGROK_SUFFIX.to_string()],
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DeliveryConfig {
    /// Checks values that would break the pool at runtime.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` describing the first problem.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(DeliveryError::configuration("worker_count must be at least 1"));
        }
        if self.batch_size == 0 {
            return Err(DeliveryError::configuration("batch_size must be at least 1"));
        }
        if self.job_lease <= self.client_config.timeout {
            return Err(DeliveryError::configuration(format!(
                "job_lease ({:?}) must exceed the HTTP timeout ({:?})",
                self.job_lease, self.client_config.timeout
            )));
        }
        if self.retry_schedule.max_attempts == 0 {
            return Err(DeliveryError::configuration("max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Counters for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Runner tasks currently alive.
    pub active_workers: usize,
    /// Jobs taken off the queue since startup.
    pub jobs_processed: u64,
    /// Deliveries answered with 2xx.
    pub successful_deliveries: u64,
    /// Deliveries stopped by a terminal failure.
    pub terminal_failures: u64,
    /// Subscribers disabled by this process.
    pub subscribers_disabled: u64,
    /// Jobs that did nothing because the attempt or subscriber was gone.
    pub skipped: u64,
    /// Jobs pushed back with backoff.
    pub retries_scheduled: u64,
    /// Jobs dropped after exhausting their attempts.
    pub jobs_discarded: u64,
    /// Deliveries running right now.
    pub in_flight_deliveries: u64,
}

/// Main delivery engine.
pub struct DeliveryEngine {
    storage: Arc<dyn DeliveryStorage>,
    config: DeliveryConfig,
    broadcaster: Arc<Broadcaster>,
    worker: DeliveryWorker,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_pool: Option<WorkerPool>,
    clock: Arc<dyn Clock>,
}

impl DeliveryEngine {
    /// Creates an engine over PostgreSQL storage.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn new(
        storage: Arc<Storage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let storage: Arc<dyn DeliveryStorage> = Arc::new(PostgresDeliveryStorage::new(storage));
        Self::with_storage(storage, config, clock)
    }

    /// Creates an engine over any storage implementation.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid or the HTTP client
    /// cannot be built.
    pub fn with_storage(
        storage: Arc<dyn DeliveryStorage>,
        config: DeliveryConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let client = Arc::new(DeliveryClient::new(config.client_config.clone())?);
        let tunnel: Arc<dyn TunnelDetector> =
            Arc::new(HostSuffixTunnelDetector::new(&config.tunnel_suffixes)?);
        let worker = DeliveryWorker::new(storage.clone(), client, tunnel);
        let broadcaster = Arc::new(Broadcaster::new(storage.clone(), clock.clone()));

        Ok(Self {
            storage,
            config,
            broadcaster,
            worker,
            stats: Arc::new(RwLock::new(EngineStats::default())),
            cancellation_token: CancellationToken::new(),
            worker_pool: None,
            clock,
        })
    }

    /// Returns the broadcaster sharing this engine's storage.
    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    /// Returns the delivery worker.
    pub fn worker(&self) -> &DeliveryWorker {
        &self.worker
    }

    /// Returns the storage the engine runs on.
    pub fn storage(&self) -> Arc<dyn DeliveryStorage> {
        self.storage.clone()
    }

    /// Spawns the job runners.
    ///
    /// # Errors
    ///
    /// Returns error if the engine is already running.
    pub async fn start(&mut self) -> Result<()> {
        if self.worker_pool.is_some() {
            return Err(DeliveryError::configuration("delivery engine already started"));
        }

        info!(
            worker_count = self.config.worker_count,
            batch_size = self.config.batch_size,
            "starting delivery engine"
        );

        let mut pool = self.pool();
        pool.spawn_workers().await?;
        self.worker_pool = Some(pool);

        Ok(())
    }

    /// Stops the runners, waiting up to the configured shutdown timeout.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ShutdownTimeout` if runners do not stop in time.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("shutting down delivery engine");

        if let Some(pool) = self.worker_pool.take() {
            pool.shutdown_graceful(self.config.shutdown_timeout).await?;
        }
        Ok(())
    }

    /// Returns a snapshot of the counters.
    pub async fn stats(&self) -> EngineStats {
        self.stats.read().await.clone()
    }

    /// Claims and runs one batch of due jobs on the calling task.
    ///
    /// Returns the number of jobs claimed. Does not require `start`.
    ///
    /// # Errors
    ///
    /// Returns error if claiming fails.
    pub async fn process_due_jobs(&self) -> Result<usize> {
        match &self.worker_pool {
            Some(pool) => pool.runner(0).process_batch().await,
            None => self.pool().runner(0).process_batch().await,
        }
    }

    fn pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.storage.clone(),
            self.worker.clone(),
            self.config.clone(),
            self.stats.clone(),
            self.cancellation_token.clone(),
            self.clock.clone(),
        )
    }
}
