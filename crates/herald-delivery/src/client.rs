//! HTTP client for webhook delivery.
//!
//! The client is transport-only: any received response, success or not,
//! comes back as `Ok(DeliveryResponse)` and is classified by the caller.
//! Only transport failures (timeout, connection refused) surface as errors.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use herald_core::{models::DEFAULT_TIMEOUT_SECONDS, signer, DeliveryId};
use reqwest::header::HeaderMap;
use tracing::{debug, info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Response bodies are stored truncated to this many bytes.
pub const MAX_RESPONSE_BYTES: usize = 10_000;

/// Configuration for the delivery HTTP client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Fallback request timeout when an endpoint has none configured.
    pub timeout: Duration,
    /// User-Agent announced on every request.
    pub user_agent: String,
    /// Maximum stored response body size in bytes.
    pub max_response_bytes: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECONDS as u64),
            user_agent: signer::USER_AGENT.to_string(),
            max_response_bytes: MAX_RESPONSE_BYTES,
        }
    }
}

/// A single webhook request, fully built and ready to send.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Ledger id of the delivery this attempt belongs to.
    pub delivery_id: DeliveryId,
    /// Destination URL.
    pub url: String,
    /// Complete header set, signature included.
    pub headers: HashMap<String, String>,
    /// Raw payload bytes.
    pub body: Vec<u8>,
    /// Hard timeout for this request.
    pub timeout: Duration,
}

/// Response received from a webhook endpoint.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Response body, truncated, if the receiver sent one.
    pub body: Option<String>,
    /// Wall-clock time from send to response.
    pub latency: Duration,
}

impl DeliveryResponse {
    /// Whether the receiver acknowledged the delivery with a 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

/// HTTP client used for all outbound webhook requests.
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl DeliveryClient {
    /// Creates a client with the given configuration.
    ///
    /// Redirects are never followed; a 3xx comes back as the response so
    /// the caller can classify it.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Internal` if the underlying client cannot
    /// be constructed.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| DeliveryError::internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    /// Sends one webhook request.
    ///
    /// The request timeout is taken from the request itself, overriding
    /// the client default, so each endpoint's configured timeout bounds
    /// its own attempts.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Timeout` or `DeliveryError::Network` when
    /// no response was received.
    pub async fn deliver(&self, request: &DeliveryRequest) -> Result<DeliveryResponse> {
        let span = info_span!(
            "deliver_webhook",
            delivery_id = %request.delivery_id,
            url = %request.url,
        );
        self.execute(request).instrument(span).await
    }

    async fn execute(&self, request: &DeliveryRequest) -> Result<DeliveryResponse> {
        let start = Instant::now();

        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .body(request.body.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| map_transport_error(&e, request.timeout))?;
        let latency = start.elapsed();

        let status_code = response.status().as_u16();
        let headers = extract_headers(response.headers());
        // A failed body read keeps the status; the response itself already
        // arrived.
        let body = match response.text().await {
            Ok(text) if text.is_empty() => None,
            Ok(text) => Some(truncate_body(&text, self.config.max_response_bytes)),
            Err(_) => None,
        };

        debug!(
            status_code,
            latency_ms = latency.as_millis() as u64,
            "webhook response received"
        );

        Ok(DeliveryResponse { status_code, headers, body, latency })
    }
}

fn map_transport_error(err: &reqwest::Error, timeout: Duration) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::timeout(timeout)
    } else if err.is_connect() {
        DeliveryError::network(format!("connection failed: {err}"))
    } else {
        DeliveryError::network(format!("request failed: {err}"))
    }
}

fn truncate_body(body: &str, max_bytes: usize) -> String {
    if body.len() <= max_bytes {
        return body.to_string();
    }
    let truncated = String::from_utf8_lossy(&body.as_bytes()[..max_bytes]);
    format!("{truncated}... (truncated)")
}

/// Converts a reqwest header map into plain strings, dropping values that
/// are not valid UTF-8.
pub fn extract_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

/// Reads a `Retry-After` response header as a delay in seconds.
///
/// Accepts the delta-seconds form and the HTTP-date form. A header that is
/// present but unparseable still signals a requested pause and maps to 60
/// seconds.
pub fn extract_retry_after_seconds(headers: &HashMap<String, String>) -> Option<u64> {
    let raw = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("retry-after"))
        .map(|(_, value)| value.trim())?;

    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(seconds);
    }

    if let Ok(at) = chrono::DateTime::parse_from_rfc2822(raw) {
        let delta = at.with_timezone(&chrono::Utc) - chrono::Utc::now();
        let seconds = delta.num_seconds().max(0);
        return Some(seconds as u64);
    }

    Some(60)
}
