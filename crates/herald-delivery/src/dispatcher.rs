//! Single-delivery dispatch: sign, send, record, resolve.
//!
//! The dispatcher owns one invariant: every dispatch call leaves the
//! delivery in a committed ledger state. A 2xx marks it `success`, a
//! retryable failure schedules the next attempt, anything else
//! dead-letters it, and each HTTP try lands in the attempt log either
//! way. Dispatch never panics and never returns an error; failures come
//! back inside the [`DispatchOutcome`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use herald_core::{
    models::{Delivery, DeliveryAttempt, Endpoint},
    signer,
    storage::deliveries::DeliveryFailure,
    time::Clock,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    client::{extract_retry_after_seconds, DeliveryClient, DeliveryRequest, DeliveryResponse},
    error::{DeliveryError, ErrorCategory, Result},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::DeliveryStorage,
};

/// Ledger rows keep a short summary of the last response body; the full
/// (truncated) body lives on the attempt record.
const SUMMARY_BODY_BYTES: usize = 1_024;

/// Result of one dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Whether the receiver acknowledged the delivery.
    pub success: bool,
    /// Why the dispatch failed, when it did.
    pub error: Option<String>,
}

impl DispatchOutcome {
    /// Outcome for an acknowledged delivery.
    pub fn delivered() -> Self {
        Self { success: true, error: None }
    }

    /// Outcome for a failed dispatch.
    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()) }
    }
}

/// Executes single delivery attempts against their endpoints.
///
/// Shared by the scheduler workers and the fan-out router; cheap to clone
/// behind an `Arc`.
pub struct Dispatcher {
    storage: Arc<dyn DeliveryStorage>,
    client: Arc<DeliveryClient>,
    retry_policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Creates a dispatcher over the given storage and HTTP client.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        client: Arc<DeliveryClient>,
        retry_policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { storage, client, retry_policy, clock }
    }

    /// Runs one delivery attempt end to end.
    ///
    /// Loads the endpoint, signs the payload with its current secret,
    /// charges an attempt, posts the request, records the attempt, and
    /// resolves the delivery's next state. Every failure path ends in a
    /// committed transition; errors are reported through the outcome, not
    /// raised.
    pub async fn dispatch(&self, delivery: &Delivery) -> DispatchOutcome {
        match self.try_dispatch(delivery).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    delivery_id = %delivery.id,
                    endpoint_id = %delivery.endpoint_id,
                    error = %err,
                    "dispatch aborted"
                );
                DispatchOutcome::failed(err.to_string())
            }
        }
    }

    async fn try_dispatch(&self, delivery: &Delivery) -> Result<DispatchOutcome> {
        let Some(endpoint) = self.storage.find_endpoint(delivery.endpoint_id).await? else {
            // The ledger row outlived its endpoint. Dead-letter loudly
            // instead of dropping; a silent drop would hide the corruption.
            return self.resolve_missing_endpoint(delivery).await;
        };

        let timestamp = self.clock.unix_timestamp();
        let headers = signer::build_headers(
            &delivery.payload,
            &endpoint.secret,
            &delivery.event_type,
            &delivery.idempotency_key,
            timestamp,
            endpoint.headers(),
        )
        .map_err(|e| DeliveryError::configuration(format!("cannot sign delivery: {e}")))?;

        let claimed = self.storage.begin_attempt(delivery.id, self.clock.now_utc()).await?;
        let attempt_number = u32::try_from(claimed.attempts).unwrap_or(u32::MAX);

        debug!(
            delivery_id = %claimed.id,
            endpoint_id = %endpoint.id,
            attempt_number,
            url = %endpoint.url,
            "attempting webhook delivery"
        );

        let request = DeliveryRequest {
            delivery_id: claimed.id,
            url: endpoint.url.clone(),
            headers: headers.clone(),
            body: claimed.payload.clone(),
            timeout: endpoint.timeout(),
        };

        let attempted_at = self.clock.now_utc();
        let started = self.clock.now();

        match self.client.deliver(&request).await {
            Ok(response) => {
                self.resolve_response(&claimed, &endpoint, &headers, attempt_number, attempted_at, response)
                    .await
            }
            Err(transport_error) => {
                let elapsed = self.clock.now().saturating_duration_since(started);
                let latency_ms = i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX);
                self.resolve_transport_failure(
                    &claimed,
                    &endpoint,
                    &headers,
                    attempt_number,
                    attempted_at,
                    latency_ms,
                    transport_error,
                )
                .await
            }
        }
    }

    /// A response arrived; record it and settle the delivery.
    async fn resolve_response(
        &self,
        delivery: &Delivery,
        endpoint: &Endpoint,
        request_headers: &std::collections::HashMap<String, String>,
        attempt_number: u32,
        attempted_at: DateTime<Utc>,
        response: DeliveryResponse,
    ) -> Result<DispatchOutcome> {
        let status = i32::from(response.status_code);
        let latency_ms = i64::try_from(response.latency.as_millis()).unwrap_or(i64::MAX);

        self.append_attempt(DeliveryAttempt {
            id: Uuid::new_v4(),
            delivery_id: delivery.id,
            attempt_number,
            request_url: endpoint.url.clone(),
            request_headers: signer::redact_headers(request_headers),
            response_status: Some(status),
            response_headers: Some(response.headers.clone()),
            response_body: response.body.clone(),
            latency_ms: Some(latency_ms),
            succeeded: response.is_success(),
            error_message: None,
            error_category: None,
            attempted_at,
        })
        .await;

        let summary = response.body.as_deref().map(summarize_body);

        if response.is_success() {
            self.storage
                .mark_success(delivery.id, status, summary, latency_ms, self.clock.now_utc())
                .await?;
            self.bump_endpoint_stats(endpoint, true).await;

            info!(
                delivery_id = %delivery.id,
                endpoint_id = %endpoint.id,
                attempt_number,
                status_code = response.status_code,
                latency_ms,
                "webhook delivered"
            );
            return Ok(DispatchOutcome::delivered());
        }

        // Retry-After is honored for rate limiting and overload answers.
        let retry_after = extract_retry_after_seconds(&response.headers)
            .filter(|_| matches!(response.status_code, 429 | 503));
        let error = DeliveryError::from_response_status(response.status_code, retry_after)
            .unwrap_or_else(|| {
                DeliveryError::internal(format!(
                    "status {} classified as neither success nor failure",
                    response.status_code
                ))
            });

        let failure = DeliveryFailure {
            response_status: Some(status),
            response_body: summary,
            latency_ms: Some(latency_ms),
            error_message: error.to_string(),
            error_category: error.category().to_string(),
        };

        self.settle_failed_attempt(delivery, endpoint, attempt_number, error, retry_after, failure)
            .await
    }

    /// No response arrived; record the attempt and settle the delivery.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_transport_failure(
        &self,
        delivery: &Delivery,
        endpoint: &Endpoint,
        request_headers: &std::collections::HashMap<String, String>,
        attempt_number: u32,
        attempted_at: DateTime<Utc>,
        latency_ms: i64,
        error: DeliveryError,
    ) -> Result<DispatchOutcome> {
        self.append_attempt(DeliveryAttempt {
            id: Uuid::new_v4(),
            delivery_id: delivery.id,
            attempt_number,
            request_url: endpoint.url.clone(),
            request_headers: signer::redact_headers(request_headers),
            response_status: None,
            response_headers: None,
            response_body: None,
            latency_ms: Some(latency_ms),
            succeeded: false,
            error_message: Some(error.to_string()),
            error_category: Some(error.category().to_string()),
            attempted_at,
        })
        .await;

        let failure = DeliveryFailure {
            response_status: None,
            response_body: None,
            latency_ms: Some(latency_ms),
            error_message: error.to_string(),
            error_category: error.category().to_string(),
        };

        self.settle_failed_attempt(delivery, endpoint, attempt_number, error, None, failure).await
    }

    /// Decides between retry and dead-letter for a failed attempt and
    /// commits that transition.
    async fn settle_failed_attempt(
        &self,
        delivery: &Delivery,
        endpoint: &Endpoint,
        attempt_number: u32,
        error: DeliveryError,
        retry_after: Option<u64>,
        failure: DeliveryFailure,
    ) -> Result<DispatchOutcome> {
        let max_attempts = u32::try_from(delivery.max_attempts).unwrap_or(u32::MAX);
        let context = RetryContext::new(
            attempt_number,
            max_attempts,
            error,
            self.clock.now_utc(),
            self.retry_policy.clone(),
        )
        .with_retry_after(retry_after.map(std::time::Duration::from_secs));

        match context.decide() {
            RetryDecision::Retry { next_retry_at } => {
                if let Some(seconds) = retry_after {
                    debug!(
                        delivery_id = %delivery.id,
                        retry_after_seconds = seconds,
                        "receiver requested the retry delay"
                    );
                }
                self.storage.schedule_retry(delivery.id, next_retry_at, failure).await?;
                warn!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    attempt_number,
                    next_retry_at = %next_retry_at,
                    error = %context.error,
                    "delivery failed, retry scheduled"
                );
            }
            RetryDecision::GiveUp { reason } => {
                self.storage
                    .mark_dead_letter(delivery.id, failure, self.clock.now_utc())
                    .await?;
                self.bump_endpoint_stats(endpoint, false).await;
                error!(
                    delivery_id = %delivery.id,
                    endpoint_id = %endpoint.id,
                    attempt_number,
                    reason = %reason,
                    error = %context.error,
                    "delivery dead-lettered"
                );
            }
        }

        Ok(DispatchOutcome::failed(context.error.to_string()))
    }

    async fn resolve_missing_endpoint(&self, delivery: &Delivery) -> Result<DispatchOutcome> {
        let message = format!(
            "endpoint {} not found for delivery {}",
            delivery.endpoint_id, delivery.id
        );
        let failure = DeliveryFailure {
            response_status: None,
            response_body: None,
            latency_ms: None,
            error_message: message.clone(),
            error_category: ErrorCategory::Internal.to_string(),
        };
        self.storage.mark_dead_letter(delivery.id, failure, self.clock.now_utc()).await?;

        error!(
            delivery_id = %delivery.id,
            endpoint_id = %delivery.endpoint_id,
            "delivery references a missing endpoint, dead-lettered"
        );
        Ok(DispatchOutcome::failed(message))
    }

    /// Appends to the attempt log. A failed append is surfaced in the log
    /// but does not abort the dispatch; the delivery state must still
    /// resolve.
    async fn append_attempt(&self, attempt: DeliveryAttempt) {
        if let Err(err) = self.storage.record_attempt(attempt).await {
            error!(error = %err, "failed to record delivery attempt");
        }
    }

    /// Endpoint counters are best effort; the delivery outcome stands even
    /// if the counter update fails.
    async fn bump_endpoint_stats(&self, endpoint: &Endpoint, delivered: bool) {
        if let Err(err) = self.storage.record_endpoint_outcome(endpoint.id, delivered).await {
            warn!(
                endpoint_id = %endpoint.id,
                error = %err,
                "failed to update endpoint delivery counters"
            );
        }
    }
}

fn summarize_body(body: &str) -> String {
    if body.len() <= SUMMARY_BODY_BYTES {
        return body.to_string();
    }
    let truncated = String::from_utf8_lossy(&body.as_bytes()[..SUMMARY_BODY_BYTES]);
    format!("{truncated}... (truncated)")
}
