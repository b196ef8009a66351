//! PostgreSQL repositories for subscribers, delivery attempts and the
//! delivery job queue.
//!
//! Every query the service issues lives in this module. Callers hold a
//! [`Storage`] and go through the repository for the table they need.

use std::sync::Arc;

use sqlx::PgPool;
use tracing::debug;

pub mod delivery_attempts;
pub mod delivery_jobs;
pub mod subscribers;

use crate::error::Result;

/// Idempotent schema bootstrap, applied in order by [`Storage::migrate`].
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS subscribers (
        id UUID PRIMARY KEY,
        name TEXT NOT NULL DEFAULT 'anonymous',
        url TEXT NOT NULL,
        enabled BOOLEAN NOT NULL DEFAULT TRUE,
        subscriptions JSONB NOT NULL DEFAULT '["*"]'::jsonb,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT subscribers_subscriptions_not_empty CHECK (
            jsonb_typeof(subscriptions) = 'array' AND jsonb_array_length(subscriptions) > 0
        )
    )
    "#,
    r"
    CREATE INDEX IF NOT EXISTS idx_subscribers_enabled
    ON subscribers(enabled, created_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS delivery_attempts (
        id UUID PRIMARY KEY,
        subscriber_id UUID NOT NULL REFERENCES subscribers(id),
        event TEXT NOT NULL CHECK (event <> ''),
        payload JSONB NOT NULL,
        response JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_delivery_attempts_subscriber
    ON delivery_attempts(subscriber_id, created_at)
    ",
    r"
    CREATE TABLE IF NOT EXISTS delivery_jobs (
        id UUID PRIMARY KEY,
        attempt_id UUID NOT NULL REFERENCES delivery_attempts(id),
        attempt_number INTEGER NOT NULL DEFAULT 0 CHECK (attempt_number >= 0),
        run_at TIMESTAMPTZ NOT NULL,
        locked_until TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS idx_delivery_jobs_due
    ON delivery_jobs(run_at, locked_until)
    ",
];

/// Container for all repositories sharing one connection pool.
#[derive(Clone)]
pub struct Storage {
    /// Subscriber registry.
    pub subscribers: Arc<subscribers::Repository>,

    /// Delivery attempt records (the event store).
    pub delivery_attempts: Arc<delivery_attempts::Repository>,

    /// Durable delivery job queue.
    pub delivery_jobs: Arc<delivery_jobs::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates a storage container over `pool`.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            subscribers: Arc::new(subscribers::Repository::new(pool.clone())),
            delivery_attempts: Arc::new(delivery_attempts::Repository::new(pool.clone())),
            delivery_jobs: Arc::new(delivery_jobs::Repository::new(pool.clone())),
            pool,
        }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates tables and indexes that do not exist yet.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&*self.pool).await?;
        }
        debug!(statements = SCHEMA.len(), "schema bootstrap applied");
        Ok(())
    }

    /// Verifies the database answers a trivial query.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;
        Ok(())
    }
}
