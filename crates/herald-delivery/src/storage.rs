//! Storage abstraction for the delivery pipeline.
//!
//! The dispatcher, scheduler, and router all talk to storage through the
//! [`DeliveryStorage`] trait so delivery logic can be tested without a
//! database. Production uses [`PostgresDeliveryStorage`] over the
//! `herald_core` repositories; tests use [`mock::MockDeliveryStorage`],
//! which enforces the same state machine guards in memory.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result,
    models::{Delivery, DeliveryAttempt, DeliveryId, Endpoint, EndpointId},
    storage::deliveries::DeliveryFailure,
};

/// Storage operations required by the delivery pipeline.
///
/// Covers the three tables the pipeline touches: endpoint configuration
/// (read plus outcome counters), the delivery ledger with its guarded
/// status transitions, and the append-only attempt log. Every transition
/// here refuses illegal moves, so callers can retry or race without
/// corrupting delivery state.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Loads one endpoint by id.
    fn find_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Endpoint>>> + Send + '_>>;

    /// Loads the active endpoints subscribed to an event type, wildcard
    /// subscribers included.
    fn find_active_endpoints<'a>(
        &'a self,
        event_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Endpoint>>> + Send + 'a>>;

    /// Bumps an endpoint's delivery counters after a terminal outcome.
    ///
    /// Called once per delivery, when it reaches `success` or
    /// `dead_letter`, never per attempt.
    fn record_endpoint_outcome(
        &self,
        endpoint_id: EndpointId,
        delivered: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Inserts a new pending delivery into the ledger.
    fn create_delivery(
        &self,
        delivery: Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryId>> + Send + '_>>;

    /// Loads one delivery by id.
    fn find_delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>>> + Send + '_>>;

    /// Moves a delivery to `processing` and charges one attempt.
    ///
    /// Refuses terminal deliveries and exhausted budgets. The returned
    /// row's `attempts` value is the 1-based number of this attempt.
    fn begin_attempt(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>>;

    /// Terminally marks a delivery delivered, recording the final response.
    fn mark_success(
        &self,
        delivery_id: DeliveryId,
        response_status: i32,
        response_body: Option<String>,
        latency_ms: i64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Moves a delivery to `failed` with its next retry time set.
    fn schedule_retry(
        &self,
        delivery_id: DeliveryId,
        next_retry_at: DateTime<Utc>,
        failure: DeliveryFailure,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Terminally dead-letters a delivery from any non-terminal status.
    fn mark_dead_letter(
        &self,
        delivery_id: DeliveryId,
        failure: DeliveryFailure,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Atomically claims due retries, moving them to `processing`.
    ///
    /// The select and the status flip commit together, so two concurrent
    /// schedulers can never claim the same delivery.
    fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>>> + Send + '_>>;

    /// Resets a dead-lettered delivery to `pending` with a fresh attempt
    /// budget, for manual redelivery.
    fn reset_for_manual_retry(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>>;

    /// Appends one attempt to the audit log.
    fn record_attempt(
        &self,
        attempt: DeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Loads a delivery's attempts, oldest first.
    fn find_attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>>;
}

/// Production storage backed by the PostgreSQL repositories.
pub struct PostgresDeliveryStorage {
    storage: Arc<herald_core::Storage>,
}

impl PostgresDeliveryStorage {
    /// Wraps the repository container in the delivery storage trait.
    pub fn new(storage: Arc<herald_core::Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn find_endpoint(
        &self,
        endpoint_id: EndpointId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Endpoint>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.find_by_id(endpoint_id).await })
    }

    fn find_active_endpoints<'a>(
        &'a self,
        event_type: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Endpoint>>> + Send + 'a>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.find_active_by_event(event_type).await })
    }

    fn record_endpoint_outcome(
        &self,
        endpoint_id: EndpointId,
        delivered: bool,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.endpoints.record_outcome(endpoint_id, delivered).await })
    }

    fn create_delivery(
        &self,
        delivery: Delivery,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryId>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.create(&delivery).await })
    }

    fn find_delivery(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.find_by_id(delivery_id).await })
    }

    fn begin_attempt(
        &self,
        delivery_id: DeliveryId,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.begin_attempt(delivery_id, now).await })
    }

    fn mark_success(
        &self,
        delivery_id: DeliveryId,
        response_status: i32,
        response_body: Option<String>,
        latency_ms: i64,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage
                .deliveries
                .mark_success(delivery_id, response_status, response_body, latency_ms, now)
                .await
        })
    }

    fn schedule_retry(
        &self,
        delivery_id: DeliveryId,
        next_retry_at: DateTime<Utc>,
        failure: DeliveryFailure,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move {
            storage.deliveries.schedule_retry(delivery_id, next_retry_at, &failure).await
        })
    }

    fn mark_dead_letter(
        &self,
        delivery_id: DeliveryId,
        failure: DeliveryFailure,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(
            async move { storage.deliveries.mark_dead_letter(delivery_id, &failure, now).await },
        )
    }

    fn claim_due(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.claim_due(now, batch_size).await })
    }

    fn reset_for_manual_retry(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.reset_for_manual_retry(delivery_id).await })
    }

    fn record_attempt(
        &self,
        attempt: DeliveryAttempt,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.attempts.create(&attempt).await.map(|_| ()) })
    }

    fn find_attempts(
        &self,
        delivery_id: DeliveryId,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.attempts.find_by_delivery(delivery_id).await })
    }
}

pub mod mock {
    //! In-memory storage for testing delivery logic without a database.
    //!
    //! The mock enforces the same guards as the SQL repositories: illegal
    //! status transitions are refused, attempt budgets are charged, the
    //! idempotency key is unique, and claiming removes a delivery from the
    //! due set. Tests that pass against the mock exercise the real state
    //! machine, not a lenient stand-in.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::Arc,
    };

    use chrono::{DateTime, Utc};
    use herald_core::{
        error::{CoreError, Result},
        models::DeliveryStatus,
        signer,
    };
    use tokio::sync::RwLock;

    use super::{
        Delivery, DeliveryAttempt, DeliveryFailure, DeliveryId, DeliveryStorage, Endpoint,
        EndpointId,
    };

    /// Mock storage with the ledger state machine enforced in memory.
    pub struct MockDeliveryStorage {
        endpoints: Arc<RwLock<HashMap<EndpointId, Endpoint>>>,
        deliveries: Arc<RwLock<HashMap<DeliveryId, Delivery>>>,
        attempts: Arc<RwLock<Vec<DeliveryAttempt>>>,
        claim_error: Arc<RwLock<Option<String>>>,
    }

    impl MockDeliveryStorage {
        /// Creates an empty mock.
        pub fn new() -> Self {
            Self {
                endpoints: Arc::new(RwLock::new(HashMap::new())),
                deliveries: Arc::new(RwLock::new(HashMap::new())),
                attempts: Arc::new(RwLock::new(Vec::new())),
                claim_error: Arc::new(RwLock::new(None)),
            }
        }

        /// Inserts or replaces an endpoint.
        ///
        /// Replacing is how tests rotate a secret or flip the active flag
        /// mid-test.
        pub async fn insert_endpoint(&self, endpoint: Endpoint) {
            self.endpoints.write().await.insert(endpoint.id, endpoint);
        }

        /// Registers a minimal active endpoint and returns it.
        pub async fn add_endpoint(&self, url: impl Into<String>, event_types: &[&str]) -> Endpoint {
            let now = Utc::now();
            let endpoint = Endpoint {
                id: EndpointId::new(),
                name: "test endpoint".to_string(),
                url: url.into(),
                description: None,
                secret: signer::generate_secret(),
                event_types: event_types.iter().map(ToString::to_string).collect(),
                is_active: true,
                headers: sqlx::types::Json(HashMap::new()),
                max_attempts: 3,
                timeout_seconds: 5,
                total_deliveries: 0,
                successful_deliveries: 0,
                failed_deliveries: 0,
                last_delivery_at: None,
                created_at: now,
                updated_at: now,
            };
            self.insert_endpoint(endpoint.clone()).await;
            endpoint
        }

        /// Inserts a delivery row directly, bypassing key uniqueness.
        pub async fn insert_delivery(&self, delivery: Delivery) {
            self.deliveries.write().await.insert(delivery.id, delivery);
        }

        /// Injects an error for the next `claim_due` call only.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Returns the current ledger row for a delivery.
        pub async fn delivery(&self, delivery_id: DeliveryId) -> Option<Delivery> {
            self.deliveries.read().await.get(&delivery_id).cloned()
        }

        /// Returns all delivery rows, unordered.
        pub async fn deliveries(&self) -> Vec<Delivery> {
            self.deliveries.read().await.values().cloned().collect()
        }

        /// Returns the current row for an endpoint.
        pub async fn endpoint(&self, endpoint_id: EndpointId) -> Option<Endpoint> {
            self.endpoints.read().await.get(&endpoint_id).cloned()
        }

        /// Returns every recorded attempt, in recording order.
        pub async fn recorded_attempts(&self) -> Vec<DeliveryAttempt> {
            self.attempts.read().await.clone()
        }

        /// Whether a delivery currently has the expected status.
        pub async fn verify_status(&self, delivery_id: DeliveryId, expected: DeliveryStatus) -> bool {
            self.deliveries.read().await.get(&delivery_id).is_some_and(|d| d.status == expected)
        }
    }

    impl Default for MockDeliveryStorage {
        fn default() -> Self {
            Self::new()
        }
    }

    fn refused(delivery: &Delivery, verb: &str) -> CoreError {
        CoreError::ConstraintViolation(format!(
            "delivery {} in status {} cannot {verb}",
            delivery.id, delivery.status
        ))
    }

    fn apply_failure(delivery: &mut Delivery, failure: &DeliveryFailure) {
        delivery.last_response_status = failure.response_status;
        delivery.last_response_body = failure.response_body.clone();
        delivery.last_latency_ms = failure.latency_ms;
        delivery.error_message = Some(failure.error_message.clone());
        delivery.error_category = Some(failure.error_category.clone());
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn find_endpoint(
            &self,
            endpoint_id: EndpointId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Endpoint>>> + Send + '_>> {
            let endpoints = self.endpoints.clone();
            Box::pin(async move { Ok(endpoints.read().await.get(&endpoint_id).cloned()) })
        }

        fn find_active_endpoints<'a>(
            &'a self,
            event_type: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Endpoint>>> + Send + 'a>> {
            let endpoints = self.endpoints.clone();
            Box::pin(async move {
                let mut subscribed: Vec<Endpoint> = endpoints
                    .read()
                    .await
                    .values()
                    .filter(|e| e.is_active && e.subscribes_to(event_type))
                    .cloned()
                    .collect();
                subscribed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                Ok(subscribed)
            })
        }

        fn record_endpoint_outcome(
            &self,
            endpoint_id: EndpointId,
            delivered: bool,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let endpoints = self.endpoints.clone();
            Box::pin(async move {
                if let Some(endpoint) = endpoints.write().await.get_mut(&endpoint_id) {
                    endpoint.total_deliveries += 1;
                    if delivered {
                        endpoint.successful_deliveries += 1;
                    } else {
                        endpoint.failed_deliveries += 1;
                    }
                    endpoint.last_delivery_at = Some(Utc::now());
                }
                Ok(())
            })
        }

        fn create_delivery(
            &self,
            delivery: Delivery,
        ) -> Pin<Box<dyn Future<Output = Result<DeliveryId>> + Send + '_>> {
            let deliveries = self.deliveries.clone();
            Box::pin(async move {
                let mut map = deliveries.write().await;
                let key_taken = map
                    .values()
                    .any(|existing| existing.idempotency_key == delivery.idempotency_key);
                if key_taken {
                    return Err(CoreError::ConstraintViolation(format!(
                        "idempotency key {} already exists",
                        delivery.idempotency_key
                    )));
                }
                let id = delivery.id;
                map.insert(id, delivery);
                Ok(id)
            })
        }

        fn find_delivery(
            &self,
            delivery_id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<Option<Delivery>>> + Send + '_>> {
            let deliveries = self.deliveries.clone();
            Box::pin(async move { Ok(deliveries.read().await.get(&delivery_id).cloned()) })
        }

        fn begin_attempt(
            &self,
            delivery_id: DeliveryId,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
            let deliveries = self.deliveries.clone();
            Box::pin(async move {
                let mut map = deliveries.write().await;
                let delivery = map
                    .get_mut(&delivery_id)
                    .ok_or_else(|| CoreError::not_found("delivery", delivery_id))?;

                let claimable = matches!(
                    delivery.status,
                    DeliveryStatus::Pending | DeliveryStatus::Processing | DeliveryStatus::Failed
                );
                if !claimable || delivery.attempts >= delivery.max_attempts {
                    return Err(refused(delivery, "begin an attempt"));
                }

                delivery.status = DeliveryStatus::Processing;
                delivery.attempts += 1;
                delivery.first_attempt_at.get_or_insert(now);
                delivery.last_attempt_at = Some(now);
                delivery.next_retry_at = None;
                Ok(delivery.clone())
            })
        }

        fn mark_success(
            &self,
            delivery_id: DeliveryId,
            response_status: i32,
            response_body: Option<String>,
            latency_ms: i64,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let deliveries = self.deliveries.clone();
            Box::pin(async move {
                let mut map = deliveries.write().await;
                let delivery = map
                    .get_mut(&delivery_id)
                    .ok_or_else(|| CoreError::not_found("delivery", delivery_id))?;

                if delivery.status != DeliveryStatus::Processing {
                    return Err(refused(delivery, "succeed"));
                }

                delivery.status = DeliveryStatus::Success;
                delivery.next_retry_at = None;
                delivery.last_response_status = Some(response_status);
                delivery.last_response_body = response_body;
                delivery.last_latency_ms = Some(latency_ms);
                delivery.error_message = None;
                delivery.error_category = None;
                delivery.completed_at = Some(now);
                Ok(())
            })
        }

        fn schedule_retry(
            &self,
            delivery_id: DeliveryId,
            next_retry_at: DateTime<Utc>,
            failure: DeliveryFailure,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let deliveries = self.deliveries.clone();
            Box::pin(async move {
                let mut map = deliveries.write().await;
                let delivery = map
                    .get_mut(&delivery_id)
                    .ok_or_else(|| CoreError::not_found("delivery", delivery_id))?;

                if delivery.status != DeliveryStatus::Processing {
                    return Err(refused(delivery, "schedule a retry"));
                }

                delivery.status = DeliveryStatus::Failed;
                delivery.next_retry_at = Some(next_retry_at);
                apply_failure(delivery, &failure);
                Ok(())
            })
        }

        fn mark_dead_letter(
            &self,
            delivery_id: DeliveryId,
            failure: DeliveryFailure,
            now: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let deliveries = self.deliveries.clone();
            Box::pin(async move {
                let mut map = deliveries.write().await;
                let delivery = map
                    .get_mut(&delivery_id)
                    .ok_or_else(|| CoreError::not_found("delivery", delivery_id))?;

                if delivery.status.is_terminal() {
                    return Err(refused(delivery, "dead-letter"));
                }

                delivery.status = DeliveryStatus::DeadLetter;
                delivery.next_retry_at = None;
                apply_failure(delivery, &failure);
                delivery.completed_at = Some(now);
                Ok(())
            })
        }

        fn claim_due(
            &self,
            now: DateTime<Utc>,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Delivery>>> + Send + '_>> {
            let deliveries = self.deliveries.clone();
            let claim_error = self.claim_error.clone();
            Box::pin(async move {
                if let Some(error) = claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let mut map = deliveries.write().await;
                let mut due: Vec<DeliveryId> = map
                    .values()
                    .filter(|d| {
                        d.status == DeliveryStatus::Failed
                            && d.next_retry_at.is_some_and(|at| at <= now)
                    })
                    .map(|d| d.id)
                    .collect();
                due.sort_by_key(|id| map.get(id).and_then(|d| d.next_retry_at));
                due.truncate(batch_size);

                let mut claimed = Vec::with_capacity(due.len());
                for id in due {
                    if let Some(delivery) = map.get_mut(&id) {
                        delivery.status = DeliveryStatus::Processing;
                        claimed.push(delivery.clone());
                    }
                }
                Ok(claimed)
            })
        }

        fn reset_for_manual_retry(
            &self,
            delivery_id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<Delivery>> + Send + '_>> {
            let deliveries = self.deliveries.clone();
            Box::pin(async move {
                let mut map = deliveries.write().await;
                let delivery = map
                    .get_mut(&delivery_id)
                    .ok_or_else(|| CoreError::not_found("delivery", delivery_id))?;

                if delivery.status != DeliveryStatus::DeadLetter {
                    return Err(refused(delivery, "be retried"));
                }

                delivery.status = DeliveryStatus::Pending;
                delivery.attempts = 0;
                delivery.next_retry_at = None;
                delivery.error_message = None;
                delivery.error_category = None;
                delivery.completed_at = None;
                Ok(delivery.clone())
            })
        }

        fn record_attempt(
            &self,
            attempt: DeliveryAttempt,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            let attempts = self.attempts.clone();
            Box::pin(async move {
                attempts.write().await.push(attempt);
                Ok(())
            })
        }

        fn find_attempts(
            &self,
            delivery_id: DeliveryId,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryAttempt>>> + Send + '_>> {
            let attempts = self.attempts.clone();
            Box::pin(async move {
                let mut found: Vec<DeliveryAttempt> = attempts
                    .read()
                    .await
                    .iter()
                    .filter(|attempt| attempt.delivery_id == delivery_id)
                    .cloned()
                    .collect();
                found.sort_by_key(|attempt| (attempt.attempted_at, attempt.attempt_number));
                Ok(found)
            })
        }
    }
}
