//! Fan-out routing: one business event, one delivery per subscriber.
//!
//! The router resolves the active endpoints subscribed to an event type,
//! writes one ledger row per endpoint, then dispatches them with bounded
//! concurrency. Per-endpoint failures are aggregated into the
//! [`FanoutReport`] and never propagate to the producer; one broken
//! receiver cannot block delivery to the others. Manual test sends and
//! manual retries reuse the same dispatch primitive on a single
//! caller-chosen endpoint or delivery.

use std::sync::Arc;

use futures::{stream, StreamExt};
use herald_core::{
    models::{Delivery, DeliveryId, DeliveryStatus, EndpointId},
    time::Clock,
};
use tracing::{debug, info, warn};

use crate::{
    dispatcher::{DispatchOutcome, Dispatcher},
    error::{DeliveryError, Result},
    storage::DeliveryStorage,
};

/// Default bound on concurrent dispatches within one fan-out call.
pub const DEFAULT_FANOUT_CONCURRENCY: usize = 8;

/// Event type used for manual test sends.
pub const TEST_EVENT_TYPE: &str = "herald.test";

/// Aggregate result of one fan-out call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    /// Endpoints that were subscribed and active.
    pub total: usize,
    /// Deliveries acknowledged on their first attempt.
    pub successful: usize,
    /// Deliveries that failed their first attempt; retryable ones stay
    /// scheduled for the retry workers.
    pub failed: usize,
}

/// Routes business events into per-endpoint deliveries.
pub struct FanoutRouter {
    storage: Arc<dyn DeliveryStorage>,
    dispatcher: Arc<Dispatcher>,
    clock: Arc<dyn Clock>,
    max_concurrency: usize,
}

impl FanoutRouter {
    /// Creates a router with the default concurrency bound.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, dispatcher, clock, max_concurrency: DEFAULT_FANOUT_CONCURRENCY }
    }

    /// Overrides the concurrency bound.
    #[must_use]
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Delivers an event to every active, subscribed endpoint.
    ///
    /// Creates one delivery per endpoint first, so the ledger records the
    /// fan-out even if dispatching is interrupted, then dispatches the
    /// batch with bounded concurrency. Endpoints whose first attempt fails
    /// count as `failed` in the report; retryable ones are already
    /// scheduled for retry by the time this returns.
    ///
    /// # Errors
    ///
    /// Returns error only if the subscriber set cannot be resolved.
    /// Individual delivery failures never surface here.
    pub async fn dispatch_to_all_endpoints(
        &self,
        event_type: &str,
        payload: &[u8],
    ) -> Result<FanoutReport> {
        let endpoints = self
            .storage
            .find_active_endpoints(event_type)
            .await
            .map_err(DeliveryError::from)?;
        let total = endpoints.len();

        if total == 0 {
            debug!(event_type, "no active endpoints subscribed");
            return Ok(FanoutReport::default());
        }

        let mut failed = 0;
        let mut prepared = Vec::with_capacity(total);
        for endpoint in endpoints {
            let delivery =
                Delivery::new(&endpoint, event_type, payload.to_vec(), self.clock.now_utc());
            match self.storage.create_delivery(delivery.clone()).await {
                Ok(_) => prepared.push(delivery),
                Err(error) => {
                    warn!(
                        endpoint_id = %endpoint.id,
                        event_type,
                        error = %error,
                        "could not create delivery for endpoint"
                    );
                    failed += 1;
                }
            }
        }

        let outcomes: Vec<DispatchOutcome> =
            stream::iter(prepared.iter().map(|delivery| self.dispatcher.dispatch(delivery)))
                .buffer_unordered(self.max_concurrency)
                .collect()
                .await;

        let successful = outcomes.iter().filter(|outcome| outcome.success).count();
        failed += outcomes.len() - successful;

        info!(event_type, total, successful, failed, "fan-out complete");
        Ok(FanoutReport { total, successful, failed })
    }

    /// Sends a synthetic test delivery to one endpoint.
    ///
    /// The endpoint is addressed directly, so its active flag and
    /// subscription set are not consulted; receivers can be verified
    /// before being switched live.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the endpoint does not
    /// exist, or `DeliveryError::Storage` if the delivery cannot be
    /// created.
    pub async fn send_test(&self, endpoint_id: EndpointId) -> Result<DispatchOutcome> {
        let endpoint = self
            .storage
            .find_endpoint(endpoint_id)
            .await?
            .ok_or_else(|| {
                DeliveryError::configuration(format!("endpoint {endpoint_id} not found"))
            })?;

        let now = self.clock.now_utc();
        let payload = serde_json::json!({
            "type": TEST_EVENT_TYPE,
            "created_at": now.to_rfc3339(),
            "data": { "object": { "test": true } },
        })
        .to_string()
        .into_bytes();

        let delivery = Delivery::new(&endpoint, TEST_EVENT_TYPE, payload, now);
        self.storage.create_delivery(delivery.clone()).await?;

        info!(
            endpoint_id = %endpoint_id,
            delivery_id = %delivery.id,
            "sending test delivery"
        );
        Ok(self.dispatcher.dispatch(&delivery).await)
    }

    /// Dispatches one delivery again, immediately, by operator request.
    ///
    /// Dead-lettered deliveries are reset to `pending` with a fresh
    /// attempt budget first. `failed` deliveries dispatch without waiting
    /// for their scheduled retry time. Successful deliveries are refused;
    /// a receiver must never see a duplicate of something it acknowledged.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the delivery does not
    /// exist, already succeeded, or is currently in flight.
    pub async fn retry_now(&self, delivery_id: DeliveryId) -> Result<DispatchOutcome> {
        let delivery = self
            .storage
            .find_delivery(delivery_id)
            .await?
            .ok_or_else(|| {
                DeliveryError::configuration(format!("delivery {delivery_id} not found"))
            })?;

        match delivery.status {
            DeliveryStatus::Success => Err(DeliveryError::configuration(format!(
                "delivery {delivery_id} already succeeded; manual retry refused"
            ))),
            DeliveryStatus::Processing => Err(DeliveryError::configuration(format!(
                "delivery {delivery_id} is currently in flight"
            ))),
            DeliveryStatus::DeadLetter => {
                let resurrected = self.storage.reset_for_manual_retry(delivery_id).await?;
                info!(delivery_id = %delivery_id, "dead-lettered delivery reset for manual retry");
                Ok(self.dispatcher.dispatch(&resurrected).await)
            }
            DeliveryStatus::Pending | DeliveryStatus::Failed => {
                Ok(self.dispatcher.dispatch(&delivery).await)
            }
        }
    }
}
