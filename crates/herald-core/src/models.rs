//! Domain models and strongly-typed identifiers.
//!
//! Defines endpoints, deliveries, delivery attempts, and newtype ID wrappers
//! for compile-time type safety. Includes database serialization traits and
//! the delivery state machine that governs every status transition in the
//! pipeline.

use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::signer;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Event-type subscription wildcard. An endpoint subscribed to `*` receives
/// every event type.
pub const WILDCARD_EVENT: &str = "*";

/// Default per-request timeout when an endpoint does not configure one.
pub const DEFAULT_TIMEOUT_SECONDS: i32 = 5;

/// Default maximum delivery attempts when an endpoint does not configure one.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 10;

/// Strongly-typed endpoint identifier.
///
/// Each endpoint represents a registered webhook destination URL with its own
/// signing secret, subscription set, and retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointId(pub Uuid);

impl EndpointId {
    /// Creates a new random endpoint ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EndpointId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for EndpointId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for EndpointId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for EndpointId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Strongly-typed delivery identifier.
///
/// A delivery is one logical attempt-group: one event bound for one endpoint,
/// tracked through its whole retry lifecycle under this ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    /// Creates a new random delivery ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeliveryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for DeliveryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl sqlx::Type<PgDb> for DeliveryId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Delivery lifecycle status.
///
/// Deliveries progress through these states; transitions outside this graph
/// are rejected by every storage backend:
///
/// ```text
/// pending    -> processing   [dispatch invoked]
/// processing -> success      [2xx response]
/// processing -> failed       [retryable failure, attempts remaining]
/// processing -> dead_letter  [non-retryable or attempts exhausted]
/// failed     -> processing   [scheduler or manual retry]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Created, waiting for the first dispatch.
    Pending,

    /// A dispatcher owns this delivery and an attempt is in flight.
    ///
    /// Claiming a delivery moves it here atomically, which is what prevents
    /// two workers from double-sending the same delivery.
    Processing,

    /// Delivered with a 2xx response. Terminal.
    Success,

    /// Last attempt failed but the delivery is retryable.
    ///
    /// Always carries a `next_retry_at`; the retry scheduler picks it up once
    /// that time passes.
    Failed,

    /// Permanently failed. Terminal.
    ///
    /// Reached on a non-retryable response or after exhausting max attempts.
    /// Requires manual intervention to resend.
    DeadLetter,
}

impl DeliveryStatus {
    /// Whether this status permits no further attempts.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::DeadLetter)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Success)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::DeadLetter)
                | (Self::Failed, Self::Processing)
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::DeadLetter => write!(f, "dead_letter"),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "dead_letter" => Ok(Self::DeadLetter),
            _ => Err(format!("invalid delivery status: {s}").into()),
        }
    }
}

/// Registered webhook endpoint.
///
/// Defines where and how to deliver events: target URL, signing secret,
/// subscribed event types, custom headers, and the retry/timeout policy
/// copied onto each delivery at creation time.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Endpoint {
    /// Unique identifier for this endpoint.
    pub id: EndpointId,

    /// Human-readable endpoint name.
    pub name: String,

    /// Target URL for webhook delivery.
    ///
    /// Must be HTTPS unless the registry was explicitly configured to allow
    /// insecure URLs for local development.
    pub url: String,

    /// Optional free-form description.
    pub description: Option<String>,

    /// Current HMAC signing secret (`whsec_` + 32 random bytes hex).
    ///
    /// Never exposed in full outside the create/rotate response; read paths
    /// surface [`Endpoint::masked_secret`] instead.
    pub secret: String,

    /// Event types this endpoint subscribes to.
    ///
    /// A literal `*` entry subscribes to every event type.
    pub event_types: Vec<String>,

    /// Whether this endpoint participates in fan-out.
    ///
    /// Inactive endpoints are skipped during fan-out but retained with their
    /// full delivery history.
    pub is_active: bool,

    /// Endpoint-configured headers merged into every outbound request.
    ///
    /// Reserved delivery headers always win over entries here.
    pub headers: sqlx::types::Json<HashMap<String, String>>,

    /// Maximum delivery attempts per delivery, including the first.
    pub max_attempts: i32,

    /// Per-request timeout in seconds.
    pub timeout_seconds: i32,

    /// Deliveries that reached a terminal state for this endpoint.
    pub total_deliveries: i64,

    /// Deliveries that ended in `success`.
    pub successful_deliveries: i64,

    /// Deliveries that ended in `dead_letter`.
    pub failed_deliveries: i64,

    /// When a delivery last reached a terminal state for this endpoint.
    pub last_delivery_at: Option<DateTime<Utc>>,

    /// When this endpoint was registered.
    pub created_at: DateTime<Utc>,

    /// When configuration was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Custom headers as a plain map.
    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers.0
    }

    /// Whether this endpoint subscribes to `event_type`, honoring the `*`
    /// wildcard.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|e| e == event_type || e == WILDCARD_EVENT)
    }

    /// Per-request timeout as a `Duration`, falling back to the default when
    /// unset or nonsensical.
    pub fn timeout(&self) -> Duration {
        let seconds =
            if self.timeout_seconds > 0 { self.timeout_seconds } else { DEFAULT_TIMEOUT_SECONDS };
        Duration::from_secs(seconds as u64)
    }

    /// Secret with everything but the prefix and last four characters hidden.
    ///
    /// This is the only form read operations may expose.
    pub fn masked_secret(&self) -> String {
        signer::mask_secret(&self.secret)
    }
}

/// Parameters for registering a new endpoint.
#[derive(Debug, Clone)]
pub struct NewEndpoint {
    /// Human-readable endpoint name. Required, non-empty.
    pub name: String,
    /// Target URL. Required; HTTPS in production mode.
    pub url: String,
    /// Optional description.
    pub description: Option<String>,
    /// Subscribed event types. Required, non-empty; `*` subscribes to all.
    pub event_types: Vec<String>,
    /// Custom headers sent with every delivery.
    pub headers: HashMap<String, String>,
    /// Maximum attempts per delivery; defaults to 10 when `None`.
    pub max_attempts: Option<i32>,
    /// Per-request timeout in seconds; defaults to 5 when `None`.
    pub timeout_seconds: Option<i32>,
}

/// Partial update of endpoint configuration.
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct EndpointPatch {
    /// New name.
    pub name: Option<String>,
    /// New target URL, validated like at registration.
    pub url: Option<String>,
    /// New description.
    pub description: Option<String>,
    /// Replacement subscription set; must be non-empty when present.
    pub event_types: Option<Vec<String>>,
    /// Replacement custom header map.
    pub headers: Option<HashMap<String, String>>,
    /// Enable or disable fan-out participation.
    pub is_active: Option<bool>,
    /// New per-delivery attempt cap.
    pub max_attempts: Option<i32>,
    /// New per-request timeout in seconds.
    pub timeout_seconds: Option<i32>,
}

/// One logical delivery of one event to one endpoint.
///
/// Carries the opaque payload, retry bookkeeping, and the idempotency key
/// that stays stable across every retry so receivers can deduplicate.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Delivery {
    /// Unique identifier for this delivery.
    pub id: DeliveryId,

    /// Endpoint this delivery targets.
    pub endpoint_id: EndpointId,

    /// Event type that triggered this delivery (e.g. `order.placed`).
    pub event_type: String,

    /// Raw payload bytes, delivered byte-for-byte and never parsed.
    pub payload: Vec<u8>,

    /// SHA-256 hex digest of the payload, computed at creation.
    pub payload_hash: String,

    /// Idempotency key (`wh_` + 16 random bytes hex).
    ///
    /// Globally unique, generated once at creation, and reused verbatim on
    /// every retry of this delivery.
    pub idempotency_key: String,

    /// Current lifecycle status.
    pub status: DeliveryStatus,

    /// Attempts made so far. Never exceeds `max_attempts`.
    pub attempts: i32,

    /// Attempt cap copied from the endpoint policy at creation time.
    pub max_attempts: i32,

    /// When the retry scheduler should pick this delivery up again.
    ///
    /// Set only in `failed`; terminal states clear it.
    pub next_retry_at: Option<DateTime<Utc>>,

    /// HTTP status of the most recent response, if one was received.
    pub last_response_status: Option<i32>,

    /// Truncated body of the most recent response.
    pub last_response_body: Option<String>,

    /// Latency of the most recent attempt in milliseconds.
    pub last_latency_ms: Option<i64>,

    /// Error description from the most recent failed attempt.
    pub error_message: Option<String>,

    /// Machine-readable category of the most recent error
    /// (`timeout`, `connection`, `client_error`, ...).
    pub error_category: Option<String>,

    /// When this delivery was created.
    pub created_at: DateTime<Utc>,

    /// When the first attempt started. Stamped once, on the first try only.
    pub first_attempt_at: Option<DateTime<Utc>>,

    /// When the most recent attempt started.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// When the delivery reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Creates a pending delivery for `endpoint`, generating the idempotency
    /// key and payload hash and copying the endpoint's attempt cap.
    pub fn new(
        endpoint: &Endpoint,
        event_type: impl Into<String>,
        payload: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Self {
        let payload_hash = signer::payload_hash(&payload);

        Self {
            id: DeliveryId::new(),
            endpoint_id: endpoint.id,
            event_type: event_type.into(),
            payload,
            payload_hash,
            idempotency_key: signer::generate_delivery_key(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts: if endpoint.max_attempts > 0 {
                endpoint.max_attempts
            } else {
                DEFAULT_MAX_ATTEMPTS
            },
            next_retry_at: None,
            last_response_status: None,
            last_response_body: None,
            last_latency_ms: None,
            error_message: None,
            error_category: None,
            created_at: now,
            first_attempt_at: None,
            last_attempt_at: None,
            completed_at: None,
        }
    }

    /// Whether no further attempts will be made.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Immutable audit record of one HTTP try belonging to a delivery.
///
/// Captures the full request/response cycle for debugging and compliance.
/// Never mutated once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    /// Unique identifier for this attempt.
    pub id: Uuid,

    /// Delivery this attempt belongs to.
    pub delivery_id: DeliveryId,

    /// Sequential attempt number, starting at 1. A manually resurrected
    /// delivery numbers its fresh attempts from 1 again.
    pub attempt_number: u32,

    /// URL the request was sent to.
    pub request_url: String,

    /// Headers sent with the request, secret-bearing values redacted.
    pub request_headers: HashMap<String, String>,

    /// HTTP status received. `None` if no response arrived.
    pub response_status: Option<i32>,

    /// Response headers received.
    pub response_headers: Option<HashMap<String, String>>,

    /// Response body, truncated to a bounded size.
    pub response_body: Option<String>,

    /// Wall-clock latency of the HTTP call in milliseconds.
    pub latency_ms: Option<i64>,

    /// Whether the attempt got a 2xx response.
    pub succeeded: bool,

    /// Human-readable error description for failed attempts.
    pub error_message: Option<String>,

    /// Machine-readable error category for failed attempts.
    pub error_category: Option<String>,

    /// When this attempt was made.
    pub attempted_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for DeliveryAttempt {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let request_headers: sqlx::types::Json<HashMap<String, String>> =
            row.try_get("request_headers")?;
        let response_headers: Option<sqlx::types::Json<HashMap<String, String>>> =
            row.try_get("response_headers")?;

        Ok(Self {
            id: row.try_get("id")?,
            delivery_id: row.try_get("delivery_id")?,
            attempt_number: {
                let val: i32 = row.try_get("attempt_number")?;
                val.try_into()
                    .map_err(|_| sqlx::Error::Decode("attempt_number cannot be negative".into()))?
            },
            request_url: row.try_get("request_url")?,
            request_headers: request_headers.0,
            response_status: row.try_get("response_status")?,
            response_headers: response_headers.map(|h| h.0),
            response_body: row.try_get("response_body")?,
            latency_ms: row.try_get("latency_ms")?,
            succeeded: row.try_get("succeeded")?,
            error_message: row.try_get("error_message")?,
            error_category: row.try_get("error_category")?,
            attempted_at: row.try_get("attempted_at")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_endpoint() -> Endpoint {
        Endpoint {
            id: EndpointId::new(),
            name: "orders".to_string(),
            url: "https://example.com/hooks".to_string(),
            description: None,
            secret: signer::generate_secret(),
            event_types: vec!["order.placed".to_string()],
            is_active: true,
            headers: sqlx::types::Json(HashMap::new()),
            max_attempts: 3,
            timeout_seconds: 5,
            total_deliveries: 0,
            successful_deliveries: 0,
            failed_deliveries: 0,
            last_delivery_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn status_display_matches_database_strings() {
        assert_eq!(DeliveryStatus::Pending.to_string(), "pending");
        assert_eq!(DeliveryStatus::Processing.to_string(), "processing");
        assert_eq!(DeliveryStatus::Success.to_string(), "success");
        assert_eq!(DeliveryStatus::Failed.to_string(), "failed");
        assert_eq!(DeliveryStatus::DeadLetter.to_string(), "dead_letter");
    }

    #[test]
    fn terminal_statuses() {
        assert!(DeliveryStatus::Success.is_terminal());
        assert!(DeliveryStatus::DeadLetter.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
        assert!(!DeliveryStatus::Processing.is_terminal());
        assert!(!DeliveryStatus::Failed.is_terminal());
    }

    #[test]
    fn legal_transitions_only() {
        use DeliveryStatus::*;

        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Success));
        assert!(Processing.can_transition_to(Failed));
        assert!(Processing.can_transition_to(DeadLetter));
        assert!(Failed.can_transition_to(Processing));

        // Terminal states permit nothing.
        for next in [Pending, Processing, Success, Failed, DeadLetter] {
            assert!(!Success.can_transition_to(next));
            assert!(!DeadLetter.can_transition_to(next));
        }
        // No shortcuts into terminal states from pending.
        assert!(!Pending.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Success));
    }

    #[test]
    fn subscription_honors_wildcard() {
        let mut endpoint = test_endpoint();
        assert!(endpoint.subscribes_to("order.placed"));
        assert!(!endpoint.subscribes_to("customer.created"));

        endpoint.event_types = vec![WILDCARD_EVENT.to_string()];
        assert!(endpoint.subscribes_to("customer.created"));
        assert!(endpoint.subscribes_to("anything.at.all"));
    }

    #[test]
    fn new_delivery_copies_endpoint_policy() {
        let endpoint = test_endpoint();
        let delivery =
            Delivery::new(&endpoint, "order.placed", br#"{"id":1}"#.to_vec(), Utc::now());

        assert_eq!(delivery.status, DeliveryStatus::Pending);
        assert_eq!(delivery.attempts, 0);
        assert_eq!(delivery.max_attempts, 3);
        assert!(delivery.idempotency_key.starts_with("wh_"));
        assert_eq!(delivery.payload_hash.len(), 64);
        assert!(delivery.next_retry_at.is_none());
    }

    #[test]
    fn new_deliveries_get_distinct_idempotency_keys() {
        let endpoint = test_endpoint();
        let a = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), Utc::now());
        let b = Delivery::new(&endpoint, "order.placed", b"{}".to_vec(), Utc::now());
        assert_ne!(a.idempotency_key, b.idempotency_key);
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn endpoint_timeout_falls_back_to_default() {
        let mut endpoint = test_endpoint();
        assert_eq!(endpoint.timeout(), Duration::from_secs(5));

        endpoint.timeout_seconds = 0;
        assert_eq!(endpoint.timeout(), Duration::from_secs(DEFAULT_TIMEOUT_SECONDS as u64));

        endpoint.timeout_seconds = 30;
        assert_eq!(endpoint.timeout(), Duration::from_secs(30));
    }
}
