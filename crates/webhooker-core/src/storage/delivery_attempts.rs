//! Repository for delivery attempt records.
//!
//! One row per (subscriber, event) match. Rows are never deleted here and
//! the `response` column is overwritten on every delivery execution.

use std::sync::Arc;

use sqlx::{types::Json, PgPool};

use crate::{
    error::{CoreError, Result},
    models::{AttemptId, AttemptResponse, DeliveryAttempt},
};

/// Repository for delivery attempt rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the subscriber does not
    /// exist, or a database error if the insert fails.
    pub async fn create(&self, attempt: &DeliveryAttempt) -> Result<AttemptId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO delivery_attempts (
                id, subscriber_id, event, payload, response, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            ",
        )
        .bind(attempt.id)
        .bind(attempt.subscriber_id)
        .bind(&attempt.event)
        .bind(Json(attempt.payload.as_value()))
        .bind(attempt.response.as_ref().map(Json))
        .bind(attempt.created_at)
        .bind(attempt.updated_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(AttemptId(id))
    }

    /// Finds an attempt by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: AttemptId) -> Result<Option<DeliveryAttempt>> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT id, subscriber_id, event, payload, response, created_at, updated_at
            FROM delivery_attempts
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(attempt)
    }

    /// Overwrites the stored outcome of an attempt.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if the attempt does not exist.
    pub async fn record_response(&self, id: AttemptId, response: &AttemptResponse) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE delivery_attempts
            SET response = $2, updated_at = NOW()
            WHERE id = $1
            ",
        )
        .bind(id)
        .bind(Json(response))
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!("delivery attempt {id} not found")));
        }

        Ok(())
    }
}
