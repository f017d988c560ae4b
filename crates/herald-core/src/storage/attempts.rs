//! Repository for the append-only attempt log.
//!
//! One row per HTTP try, capturing the full request/response cycle for
//! auditing and debugging. Rows are never updated or deleted; a delivery's
//! history is the ordered set of its attempt rows.

use std::sync::Arc;

use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::Result,
    models::{DeliveryAttempt, DeliveryId},
};

/// Repository for delivery attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Records one delivery attempt.
    ///
    /// Attempt rows are immutable once written and never constrained
    /// against each other: a manually resurrected delivery numbers its
    /// fresh attempts from 1 again, and both lives stay in the log.
    ///
    /// # Errors
    ///
    /// Returns error if insert fails.
    pub async fn create(&self, attempt: &DeliveryAttempt) -> Result<Uuid> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO delivery_attempts (
                id, delivery_id, attempt_number, request_url, request_headers,
                response_status, response_headers, response_body, latency_ms,
                succeeded, error_message, error_category, attempted_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13
            )
            RETURNING id
            ",
        )
        .bind(attempt.id)
        .bind(attempt.delivery_id)
        .bind(i32::try_from(attempt.attempt_number).unwrap_or(i32::MAX))
        .bind(&attempt.request_url)
        .bind(sqlx::types::Json(&attempt.request_headers))
        .bind(attempt.response_status)
        .bind(attempt.response_headers.as_ref().map(sqlx::types::Json))
        .bind(&attempt.response_body)
        .bind(attempt.latency_ms)
        .bind(attempt.succeeded)
        .bind(&attempt.error_message)
        .bind(&attempt.error_category)
        .bind(attempt.attempted_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(id)
    }

    /// Finds all attempts for a delivery, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_delivery(&self, delivery_id: DeliveryId) -> Result<Vec<DeliveryAttempt>> {
        let attempts = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT id, delivery_id, attempt_number, request_url, request_headers,
                   response_status, response_headers, response_body, latency_ms,
                   succeeded, error_message, error_category, attempted_at
            FROM delivery_attempts
            WHERE delivery_id = $1
            ORDER BY attempted_at ASC, attempt_number ASC
            ",
        )
        .bind(delivery_id)
        .fetch_all(&*self.pool)
        .await?;

        Ok(attempts)
    }

    /// Finds the most recent attempt for a delivery.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_latest_by_delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Result<Option<DeliveryAttempt>> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            SELECT id, delivery_id, attempt_number, request_url, request_headers,
                   response_status, response_headers, response_body, latency_ms,
                   succeeded, error_message, error_category, attempted_at
            FROM delivery_attempts
            WHERE delivery_id = $1
            ORDER BY attempted_at DESC, attempt_number DESC
            LIMIT 1
            ",
        )
        .bind(delivery_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(attempt)
    }

    /// Counts attempts recorded for a delivery.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_delivery(&self, delivery_id: DeliveryId) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM delivery_attempts
            WHERE delivery_id = $1
            ",
        )
        .bind(delivery_id)
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool));
    }
}
