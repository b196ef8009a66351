//! Durable delivery job queue.
//!
//! Workers claim due jobs with `FOR UPDATE SKIP LOCKED` and hold them under
//! a lease (`locked_until`). A job whose lease expires becomes claimable
//! again, which gives at-least-once execution. Completed and exhausted
//! jobs are deleted; nothing is kept as a dead letter.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{DeliveryJob, JobId},
};

/// Repository for delivery job rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Adds a job to the queue.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails or the attempt does not exist.
    pub async fn enqueue(&self, job: &DeliveryJob) -> Result<JobId> {
        let attempt_number = i32::try_from(job.attempt_number)
            .map_err(|_| CoreError::invalid("attempt_number out of range"))?;

        let id: Uuid = sqlx::query_scalar(
            r"
            INSERT INTO delivery_jobs
                (id, attempt_id, attempt_number, run_at, locked_until, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            ",
        )
        .bind(job.id)
        .bind(job.attempt_id)
        .bind(attempt_number)
        .bind(job.run_at)
        .bind(job.locked_until)
        .bind(job.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(JobId(id))
    }

    /// Claims up to `batch_size` due jobs and leases them until `now + lease`.
    ///
    /// Each claimed job's `attempt_number` is incremented, so the returned
    /// value is the number of the execution about to start.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<DeliveryJob>> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|_| CoreError::invalid("job lease out of range"))?;
        let limit = i64::try_from(batch_size).unwrap_or(i64::MAX);

        let mut tx = self.pool.begin().await?;

        let job_ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM delivery_jobs
            WHERE run_at <= $1
              AND (locked_until IS NULL OR locked_until <= $1)
            ORDER BY run_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if job_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let jobs = sqlx::query_as::<_, DeliveryJob>(
            r"
            UPDATE delivery_jobs
            SET locked_until = $2, attempt_number = attempt_number + 1
            WHERE id = ANY($1)
            RETURNING id, attempt_id, attempt_number, run_at, locked_until, created_at
            ",
        )
        .bind(&job_ids)
        .bind(now + lease)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(jobs)
    }

    /// Releases a job's lease and schedules its next execution.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the job no longer exists.
    pub async fn reschedule(&self, id: JobId, run_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE delivery_jobs
            SET run_at = $2, locked_until = NULL
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(run_at)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("delivery job {id} not found")));
        }

        Ok(())
    }

    /// Removes a finished or exhausted job.
    ///
    /// Deleting an already-removed job is not an error.
    ///
    /// # Errors
    ///
    /// Returns error if delete fails.
    pub async fn complete(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM delivery_jobs WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        Ok(())
    }
}
