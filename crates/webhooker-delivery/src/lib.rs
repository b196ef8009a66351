//! Webhook fan-out and delivery.
//!
//! The [`Broadcaster`](broadcast::Broadcaster) turns one event into one
//! delivery attempt per interested subscriber and enqueues a job for each.
//! The [`DeliveryWorker`](worker::DeliveryWorker) performs a single HTTP
//! POST for an attempt, records what happened, and tells the queue whether
//! to try again.
//!
//! # Architecture
//!
//! Jobs live in PostgreSQL and are claimed by a supervised pool of tokio
//! tasks with `FOR UPDATE SKIP LOCKED` and a lease. Each claimed job runs
//! the worker to completion and is then settled:
//!
//! 1. **Claim** - take up to `batch_size` due jobs and lease them
//! 2. **Deliver** - re-read the attempt and subscriber, POST once
//! 3. **Classify** - transport failures and tunnel responses may disable
//!    the subscriber; everything terminal is recorded on the attempt
//! 4. **Settle** - delete the job, or push `run_at` out by `n^5` seconds
//!    plus jitter until ten executions have been spent
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use webhooker_core::{storage::Storage, Clock, RealClock};
//! use webhooker_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//!
//! # async fn example(storage: Arc<Storage>) -> std::result::Result<(), DeliveryError> {
//! let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
//! let mut engine = DeliveryEngine::new(storage, DeliveryConfig::default(), clock)?;
//!
//! engine.start().await?;
//! let payload = serde_json::json!({"id": 7});
//! let report = engine.broadcaster().broadcast("user.created", payload).await?;
//! println!("queued {} deliveries", report.enqueued.len());
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod broadcast;
pub mod client;
pub mod engine;
pub mod error;
pub mod outcome;
pub mod retry;
pub mod storage;
pub mod tunnel;
pub mod worker;
pub mod worker_pool;

pub use broadcast::{BroadcastReport, Broadcaster};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, Result, TransportErrorKind};
pub use outcome::{DeliveryOutcome, SkipReason, TerminalReason};
pub use retry::{RetryDecision, RetrySchedule};
pub use tunnel::{FailureAction, HostSuffixTunnelDetector, TunnelDetector};
pub use worker::DeliveryWorker;

/// Default number of concurrent job runners.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default number of jobs claimed per poll.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default HTTP request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// `User-Agent` sent with every callback.
pub const DEFAULT_USER_AGENT: &str = "webhooker/1.0";
