//! Subscriber registry.
//!
//! The delivery pipeline only reads subscribers and, on terminal
//! failures, disables them.

use std::sync::Arc;

use chrono::Utc;
use sqlx::{types::Json, PgPool};

use crate::{
    error::{CoreError, Result},
    models::{NewSubscriber, Subscriber, SubscriberId},
};

/// Repository for subscriber rows.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Validates and inserts a new subscriber.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` when validation fails, or a
    /// database error if the insert fails.
    pub async fn create(&self, new: NewSubscriber) -> Result<Subscriber> {
        let subscriber = new.into_subscriber(Utc::now())?;

        sqlx::query(
            r"
            INSERT INTO subscribers (id, name, url, enabled, subscriptions, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ",
        )
        .bind(subscriber.id)
        .bind(&subscriber.name)
        .bind(&subscriber.url)
        .bind(subscriber.enabled)
        .bind(Json(subscriber.subscriptions.patterns()))
        .bind(subscriber.created_at)
        .bind(subscriber.updated_at)
        .execute(&*self.pool)
        .await?;

        Ok(subscriber)
    }

    /// Finds a subscriber by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, id: SubscriberId) -> Result<Option<Subscriber>> {
        let subscriber = sqlx::query_as::<_, Subscriber>(
            r"
            SELECT id, name, url, enabled, subscriptions, created_at, updated_at
            FROM subscribers
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(subscriber)
    }

    /// Lists enabled subscribers in registration order.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_enabled(&self) -> Result<Vec<Subscriber>> {
        let subscribers = sqlx::query_as::<_, Subscriber>(
            r"
            SELECT id, name, url, enabled, subscriptions, created_at, updated_at
            FROM subscribers
            WHERE enabled = true
            ORDER BY created_at ASC, id ASC
            ",
        )
        .fetch_all(&*self.pool)
        .await?;

        Ok(subscribers)
    }

    /// Disables a subscriber.
    ///
    /// Conditional on the row still being enabled, so concurrent callers
    /// race harmlessly. Returns `true` only for the call that flipped it.
    ///
    /// # Errors
    ///
    /// Returns error if update fails.
    pub async fn disable(&self, id: SubscriberId) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE subscribers
            SET enabled = false, updated_at = NOW()
            WHERE id = $1 AND enabled = true
            ",
        )
        .bind(id)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_rejects_invalid_input_before_touching_database() {
        let pool = PgPool::connect_lazy("postgresql://localhost/webhooker_test").unwrap();
        let repo = Repository::new(Arc::new(pool));

        let err = repo.create(NewSubscriber::new("not-a-url")).await.unwrap_err();
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }
}
