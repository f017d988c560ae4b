//! Repository for the delivery ledger.
//!
//! Every status transition a delivery makes goes through this module, and
//! each update keyed by id carries a status guard in its WHERE clause so an
//! illegal transition can never be written, no matter what the caller got
//! wrong. Claiming due retries uses `FOR UPDATE SKIP LOCKED` so concurrent
//! schedulers never hand the same delivery to two workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{Delivery, DeliveryId, DeliveryStatus, EndpointId},
};

/// Parameters describing a failed attempt, recorded on the delivery row.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    /// HTTP status received, if any response arrived.
    pub response_status: Option<i32>,
    /// Truncated response body, if any response arrived.
    pub response_body: Option<String>,
    /// Latency of the attempt in milliseconds.
    pub latency_ms: Option<i64>,
    /// Human-readable error description.
    pub error_message: String,
    /// Machine-readable error category.
    pub error_category: String,
}

/// Repository for delivery database operations.
///
/// Handles creation, the guarded status transitions of the delivery state
/// machine, and atomic claiming of due retries for the scheduler.
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

    /// Inserts a new delivery row.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the idempotency key
    /// collides with an existing delivery.
    pub async fn create(&self, delivery: &Delivery) -> Result<DeliveryId> {
        let id = sqlx::query_scalar(
            r"
            INSERT INTO deliveries (
                id, endpoint_id, event_type, payload, payload_hash,
                idempotency_key, status, attempts, max_attempts, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
            )
            RETURNING id
            ",
        )
        .bind(delivery.id)
        .bind(delivery.endpoint_id)
        .bind(&delivery.event_type)
        .bind(&delivery.payload)
        .bind(&delivery.payload_hash)
        .bind(&delivery.idempotency_key)
        .bind(delivery.status.to_string())
        .bind(delivery.attempts)
        .bind(delivery.max_attempts)
        .bind(delivery.created_at)
        .fetch_one(&*self.pool)
        .await?;

        Ok(DeliveryId(id))
    }

    /// Finds a delivery by ID.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_id(&self, delivery_id: DeliveryId) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r"
            SELECT id, endpoint_id, event_type, payload, payload_hash,
                   idempotency_key, status, attempts, max_attempts, next_retry_at,
                   last_response_status, last_response_body, last_latency_ms,
                   error_message, error_category,
                   created_at, first_attempt_at, last_attempt_at, completed_at
            FROM deliveries
            WHERE id = $1
            ",
        )
        .bind(delivery_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Finds a delivery by its idempotency key.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r"
            SELECT id, endpoint_id, event_type, payload, payload_hash,
                   idempotency_key, status, attempts, max_attempts, next_retry_at,
                   last_response_status, last_response_body, last_latency_ms,
                   error_message, error_category,
                   created_at, first_attempt_at, last_attempt_at, completed_at
            FROM deliveries
            WHERE idempotency_key = $1
            ",
        )
        .bind(key)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(delivery)
    }

    /// Moves a delivery into `processing` and increments its attempt count.
    ///
    /// Accepts deliveries in `pending` (first dispatch), `failed` (manual
    /// retry), or `processing` (already claimed by the scheduler). Stamps
    /// `first_attempt_at` on the first try only. Returns the updated row,
    /// whose `attempts` value is this attempt's 1-based number.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no delivery has this ID, or
    /// `CoreError::ConstraintViolation` if the delivery is terminal or has
    /// exhausted its attempt budget.
    pub async fn begin_attempt(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Result<Delivery> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r"
            UPDATE deliveries
            SET status = 'processing',
                attempts = attempts + 1,
                first_attempt_at = COALESCE(first_attempt_at, $2),
                last_attempt_at = $2,
                next_retry_at = NULL
            WHERE id = $1
              AND status IN ('pending', 'processing', 'failed')
              AND attempts < max_attempts
            RETURNING id, endpoint_id, event_type, payload, payload_hash,
                      idempotency_key, status, attempts, max_attempts, next_retry_at,
                      last_response_status, last_response_body, last_latency_ms,
                      error_message, error_category,
                      created_at, first_attempt_at, last_attempt_at, completed_at
            ",
        )
        .bind(delivery_id)
        .bind(now)
        .fetch_optional(&*self.pool)
        .await?;

        match delivery {
            Some(delivery) => Ok(delivery),
            None => Err(self.explain_refused_transition(delivery_id, "begin an attempt").await),
        }
    }

    /// Marks a delivery as successfully delivered. Terminal.
    ///
    /// Records the final response and clears retry scheduling and error
    /// state.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` unless the delivery is in
    /// `processing`.
    pub async fn mark_success(
        &self,
        delivery_id: DeliveryId,
        response_status: i32,
        response_body: Option<String>,
        latency_ms: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE deliveries
            SET status = 'success',
                next_retry_at = NULL,
                last_response_status = $2,
                last_response_body = $3,
                last_latency_ms = $4,
                error_message = NULL,
                error_category = NULL,
                completed_at = $5
            WHERE id = $1 AND status = 'processing'
            ",
        )
        .bind(delivery_id)
        .bind(response_status)
        .bind(response_body)
        .bind(latency_ms)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_refused_transition(delivery_id, "succeed").await);
        }

        Ok(())
    }

    /// Marks a delivery as failed and schedules its next retry.
    ///
    /// The delivery moves to `failed` with `next_retry_at` set; the
    /// scheduler claims it once that time passes.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` unless the delivery is in
    /// `processing`.
    pub async fn schedule_retry(
        &self,
        delivery_id: DeliveryId,
        next_retry_at: DateTime<Utc>,
        failure: &DeliveryFailure,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE deliveries
            SET status = 'failed',
                next_retry_at = $2,
                last_response_status = $3,
                last_response_body = $4,
                last_latency_ms = $5,
                error_message = $6,
                error_category = $7
            WHERE id = $1 AND status = 'processing'
            ",
        )
        .bind(delivery_id)
        .bind(next_retry_at)
        .bind(failure.response_status)
        .bind(&failure.response_body)
        .bind(failure.latency_ms)
        .bind(&failure.error_message)
        .bind(&failure.error_category)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_refused_transition(delivery_id, "schedule a retry").await);
        }

        Ok(())
    }

    /// Moves a delivery to `dead_letter`. Terminal.
    ///
    /// Used both when an attempt fails non-retryably or exhausts the budget,
    /// and when a delivery cannot be dispatched at all (endpoint deleted
    /// under it), so any non-terminal status is accepted.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` if the delivery is already
    /// terminal.
    pub async fn mark_dead_letter(
        &self,
        delivery_id: DeliveryId,
        failure: &DeliveryFailure,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE deliveries
            SET status = 'dead_letter',
                next_retry_at = NULL,
                last_response_status = $2,
                last_response_body = $3,
                last_latency_ms = $4,
                error_message = $5,
                error_category = $6,
                completed_at = $7
            WHERE id = $1 AND status NOT IN ('success', 'dead_letter')
            ",
        )
        .bind(delivery_id)
        .bind(failure.response_status)
        .bind(&failure.response_body)
        .bind(failure.latency_ms)
        .bind(&failure.error_message)
        .bind(&failure.error_category)
        .bind(now)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.explain_refused_transition(delivery_id, "dead-letter").await);
        }

        Ok(())
    }

    /// Claims due retries for dispatch, moving them to `processing`.
    ///
    /// Selects `failed` deliveries whose `next_retry_at` has passed, oldest
    /// deadline first, with `FOR UPDATE SKIP LOCKED` so concurrent
    /// schedulers each claim a disjoint set. The select and the status flip
    /// commit in one transaction; a delivery can therefore never be claimed
    /// twice.
    ///
    /// # Errors
    ///
    /// Returns error if the database transaction fails.
    pub async fn claim_due(&self, now: DateTime<Utc>, batch_size: usize) -> Result<Vec<Delivery>> {
        let mut tx = self.pool.begin().await?;

        let delivery_ids: Vec<Uuid> = sqlx::query_scalar(
            r"
            SELECT id FROM deliveries
            WHERE status = 'failed'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            ",
        )
        .bind(now)
        .bind(batch_size as i32)
        .fetch_all(&mut *tx)
        .await?;

        if delivery_ids.is_empty() {
            tx.rollback().await?;
            return Ok(Vec::new());
        }

        let deliveries = sqlx::query_as::<_, Delivery>(
            r"
            UPDATE deliveries
            SET status = 'processing'
            WHERE id = ANY($1)
            RETURNING id, endpoint_id, event_type, payload, payload_hash,
                      idempotency_key, status, attempts, max_attempts, next_retry_at,
                      last_response_status, last_response_body, last_latency_ms,
                      error_message, error_category,
                      created_at, first_attempt_at, last_attempt_at, completed_at
            ",
        )
        .bind(&delivery_ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(deliveries)
    }

    /// Lists deliveries for an endpoint, newest first, optionally filtered
    /// by status and event type.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_by_endpoint(
        &self,
        endpoint_id: EndpointId,
        status: Option<DeliveryStatus>,
        event_type: Option<&str>,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<Delivery>> {
        let deliveries = sqlx::query_as::<_, Delivery>(
            r"
            SELECT id, endpoint_id, event_type, payload, payload_hash,
                   idempotency_key, status, attempts, max_attempts, next_retry_at,
                   last_response_status, last_response_body, last_latency_ms,
                   error_message, error_category,
                   created_at, first_attempt_at, last_attempt_at, completed_at
            FROM deliveries
            WHERE endpoint_id = $1
              AND ($2::text IS NULL OR status = $2)
              AND ($3::text IS NULL OR event_type = $3)
            ORDER BY created_at DESC
            LIMIT $4 OFFSET $5
            ",
        )
        .bind(endpoint_id)
        .bind(status.map(|s| s.to_string()))
        .bind(event_type)
        .bind(limit.unwrap_or(100))
        .bind(offset.unwrap_or(0))
        .fetch_all(&*self.pool)
        .await?;

        Ok(deliveries)
    }

    /// Lists dead-lettered deliveries, most recently buried first.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn find_dead_letters(&self, limit: Option<i64>) -> Result<Vec<Delivery>> {
        let deliveries = sqlx::query_as::<_, Delivery>(
            r"
            SELECT id, endpoint_id, event_type, payload, payload_hash,
                   idempotency_key, status, attempts, max_attempts, next_retry_at,
                   last_response_status, last_response_body, last_latency_ms,
                   error_message, error_category,
                   created_at, first_attempt_at, last_attempt_at, completed_at
            FROM deliveries
            WHERE status = 'dead_letter'
            ORDER BY completed_at DESC
            LIMIT $1
            ",
        )
        .bind(limit.unwrap_or(100))
        .fetch_all(&*self.pool)
        .await?;

        Ok(deliveries)
    }

    /// Counts deliveries in a given status.
    ///
    /// # Errors
    ///
    /// Returns error if query fails.
    pub async fn count_by_status(&self, status: DeliveryStatus) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            r"
            SELECT COUNT(*) FROM deliveries
            WHERE status = $1
            ",
        )
        .bind(status.to_string())
        .fetch_one(&*self.pool)
        .await?;

        Ok(count.0)
    }

    /// Resurrects a dead-lettered delivery for manual redelivery.
    ///
    /// Resets the delivery to `pending` with a fresh attempt budget and
    /// cleared error state. The idempotency key is kept, so receivers see
    /// the redelivery as the same logical delivery.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::NotFound` if no delivery has this ID, or
    /// `CoreError::ConstraintViolation` if it is not in `dead_letter`
    /// (successful deliveries are never resent).
    pub async fn reset_for_manual_retry(&self, delivery_id: DeliveryId) -> Result<Delivery> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r"
            UPDATE deliveries
            SET status = 'pending',
                attempts = 0,
                next_retry_at = NULL,
                error_message = NULL,
                error_category = NULL,
                completed_at = NULL
            WHERE id = $1 AND status = 'dead_letter'
            RETURNING id, endpoint_id, event_type, payload, payload_hash,
                      idempotency_key, status, attempts, max_attempts, next_retry_at,
                      last_response_status, last_response_body, last_latency_ms,
                      error_message, error_category,
                      created_at, first_attempt_at, last_attempt_at, completed_at
            ",
        )
        .bind(delivery_id)
        .fetch_optional(&*self.pool)
        .await?;

        match delivery {
            Some(delivery) => Ok(delivery),
            None => Err(self.explain_refused_transition(delivery_id, "be retried").await),
        }
    }

    /// Builds the error for a guarded update that matched no rows: either
    /// the delivery does not exist, or its current status forbids the
    /// transition.
    async fn explain_refused_transition(&self, delivery_id: DeliveryId, verb: &str) -> CoreError {
        match self.find_by_id(delivery_id).await {
            Ok(Some(delivery)) => CoreError::ConstraintViolation(format!(
                "delivery {delivery_id} in status {} cannot {verb}",
                delivery.status
            )),
            Ok(None) => CoreError::not_found("delivery", delivery_id),
            Err(err) => err,
        }
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
