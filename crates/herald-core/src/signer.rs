//! Request signing and credential generation for outbound deliveries.
//!
//! Signatures are HMAC-SHA256 over `"{timestamp}.{payload}"`, binding each
//! request to both its content and the moment it was signed so receivers can
//! reject stale replays. Also generates endpoint secrets and delivery
//! idempotency keys from a CSPRNG, and builds the full outbound header set.

use std::{collections::HashMap, fmt, time::Duration};

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Prefix for endpoint signing secrets.
pub const SECRET_PREFIX: &str = "whsec_";

/// Prefix for delivery idempotency keys.
pub const DELIVERY_KEY_PREFIX: &str = "wh_";

/// Header carrying the delivery idempotency key.
pub const DELIVERY_ID_HEADER: &str = "X-Herald-Delivery-Id";

/// Header carrying the unix timestamp the request was signed at.
pub const TIMESTAMP_HEADER: &str = "X-Herald-Timestamp";

/// Header carrying the payload signature, formatted `sha256=<hex>`.
pub const SIGNATURE_HEADER: &str = "X-Herald-Signature";

/// Header carrying the event type that triggered the delivery.
pub const EVENT_TYPE_HEADER: &str = "X-Herald-Event";

/// User-agent sent with every delivery.
pub const USER_AGENT: &str = "Herald-Webhook-Delivery/1.0";

/// Tolerated forward clock skew when verifying timestamps.
const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// Signing and verification errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Secret key was rejected by the MAC implementation.
    InvalidSecret,
    /// Signature header is not in a recognized format.
    InvalidFormat(String),
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSecret => write!(f, "invalid secret key"),
            Self::InvalidFormat(format) => write!(f, "invalid signature format: {format}"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Result of receiver-side signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    /// Whether the signature is valid and fresh.
    pub is_valid: bool,
    /// Error message if verification failed.
    pub error_message: Option<String>,
}

impl ValidationResult {
    /// Creates a successful validation result.
    pub fn valid() -> Self {
        Self { is_valid: true, error_message: None }
    }

    /// Creates a failed validation result with error message.
    pub fn invalid(message: impl Into<String>) -> Self {
        Self { is_valid: false, error_message: Some(message.into()) }
    }
}

/// Computes the HMAC-SHA256 signature for `payload` at `timestamp`.
///
/// The signed message is `"{timestamp}.{payload}"`; identical inputs always
/// produce identical signatures, and changing either input changes the
/// result. Returns lowercase hex without the `sha256=` prefix.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret is rejected by the
/// MAC implementation.
pub fn sign(payload: &[u8], secret: &str, timestamp: i64) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| SignatureError::InvalidSecret)?;

    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);

    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Computes the signature header value, `sha256=<hex>`.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if the secret is rejected.
pub fn signature_header(
    payload: &[u8],
    secret: &str,
    timestamp: i64,
) -> Result<String, SignatureError> {
    Ok(format!("sha256={}", sign(payload, secret, timestamp)?))
}

/// Verifies a received signature against the shared secret.
///
/// Recomputes the HMAC over `"{timestamp}.{payload}"` and compares in
/// constant time. Rejects timestamps older than `max_age` (replay
/// protection) or more than 60 seconds in the future (clock skew bound).
/// `now` is the receiver's current unix time, injected for testability.
pub fn verify(
    payload: &[u8],
    secret: &str,
    timestamp: i64,
    signature: &str,
    max_age: Duration,
    now: i64,
) -> ValidationResult {
    if signature.is_empty() {
        return ValidationResult::invalid("signature is empty");
    }
    if secret.is_empty() {
        return ValidationResult::invalid("secret is empty");
    }

    let age = now - timestamp;
    if age > max_age.as_secs() as i64 {
        return ValidationResult::invalid(format!("timestamp too old: {age}s"));
    }
    if timestamp - now > MAX_CLOCK_SKEW.as_secs() as i64 {
        return ValidationResult::invalid("timestamp is in the future");
    }

    let provided = match parse_signature(signature) {
        Ok(hex) => hex,
        Err(err) => return ValidationResult::invalid(err.to_string()),
    };

    let expected = match sign(payload, secret, timestamp) {
        Ok(sig) => sig,
        Err(err) => return ValidationResult::invalid(err.to_string()),
    };

    if timing_safe_eq(provided.as_bytes(), expected.as_bytes()) {
        ValidationResult::valid()
    } else {
        ValidationResult::invalid("signature mismatch")
    }
}

/// Parses a signature header value to raw hex.
///
/// Accepts `sha256=<hex>` (the format this engine sends) and bare 64-char
/// hex for receivers that strip the prefix.
fn parse_signature(signature: &str) -> Result<&str, SignatureError> {
    if let Some(hex) = signature.strip_prefix("sha256=") {
        return Ok(hex);
    }

    if signature.len() == 64 && signature.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(signature);
    }

    Err(SignatureError::InvalidFormat(signature.to_string()))
}

/// Constant-time byte comparison to prevent timing attacks on signature
/// verification.
fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Generates a new endpoint signing secret: `whsec_` + 32 random bytes hex.
///
/// Uses the thread-local CSPRNG.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    format!("{SECRET_PREFIX}{}", hex::encode(bytes))
}

/// Generates a new delivery idempotency key: `wh_` + 16 random bytes hex.
///
/// Uses the thread-local CSPRNG. The key is attached to a delivery once and
/// sent unchanged with every attempt so receivers can deduplicate retries.
pub fn generate_delivery_key() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    format!("{DELIVERY_KEY_PREFIX}{}", hex::encode(bytes))
}

/// SHA-256 hex digest of a payload, recorded on each delivery for audit.
pub fn payload_hash(payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hex::encode(hasher.finalize())
}

/// Masks a secret for display: prefix kept, all but the last four characters
/// hidden.
pub fn mask_secret(secret: &str) -> String {
    let visible = 4.min(secret.len());
    let suffix = &secret[secret.len() - visible..];

    match secret.strip_prefix(SECRET_PREFIX) {
        Some(_) => format!("{SECRET_PREFIX}****{suffix}"),
        None => format!("****{suffix}"),
    }
}

/// Builds the complete outbound header set for one delivery attempt.
///
/// Always includes content-type, the delivery id, timestamp, signature,
/// event type, and user-agent headers. Endpoint-configured `extra` headers
/// are merged in first so the reserved delivery headers can never be
/// overridden by endpoint configuration.
///
/// # Errors
///
/// Returns `SignatureError::InvalidSecret` if signing fails.
pub fn build_headers(
    payload: &[u8],
    secret: &str,
    event_type: &str,
    delivery_key: &str,
    timestamp: i64,
    extra: &HashMap<String, String>,
) -> Result<HashMap<String, String>, SignatureError> {
    let mut headers = HashMap::with_capacity(extra.len() + 6);

    for (key, value) in extra {
        if !is_reserved_header(key) {
            headers.insert(key.clone(), value.clone());
        }
    }

    headers.insert("Content-Type".to_string(), "application/json".to_string());
    headers.insert("User-Agent".to_string(), USER_AGENT.to_string());
    headers.insert(DELIVERY_ID_HEADER.to_string(), delivery_key.to_string());
    headers.insert(TIMESTAMP_HEADER.to_string(), timestamp.to_string());
    headers.insert(SIGNATURE_HEADER.to_string(), signature_header(payload, secret, timestamp)?);
    headers.insert(EVENT_TYPE_HEADER.to_string(), event_type.to_string());

    Ok(headers)
}

/// Whether a header name is reserved for the delivery engine and must not be
/// overridden by endpoint configuration.
fn is_reserved_header(name: &str) -> bool {
    let lowercase = name.to_lowercase();
    lowercase == "content-type"
        || lowercase == "user-agent"
        || lowercase == DELIVERY_ID_HEADER.to_lowercase()
        || lowercase == TIMESTAMP_HEADER.to_lowercase()
        || lowercase == SIGNATURE_HEADER.to_lowercase()
        || lowercase == EVENT_TYPE_HEADER.to_lowercase()
}

/// Returns a copy of `headers` with secret-bearing values replaced, safe to
/// persist on attempt records.
pub fn redact_headers(headers: &HashMap<String, String>) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(key, value)| {
            if is_sensitive_header(key) {
                (key.clone(), "[redacted]".to_string())
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect()
}

fn is_sensitive_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "authorization" | "proxy-authorization" | "cookie" | "set-cookie" | "x-api-key"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_0000000000000000000000000000000000000000000000000000000000000000";

    #[test]
    fn signing_is_deterministic() {
        let a = sign(b"{\"id\":1}", SECRET, 1_700_000_000).unwrap();
        let b = sign(b"{\"id\":1}", SECRET, 1_700_000_000).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn changing_any_input_changes_signature() {
        let base = sign(b"payload", SECRET, 1_700_000_000).unwrap();

        assert_ne!(base, sign(b"payload!", SECRET, 1_700_000_000).unwrap());
        assert_ne!(base, sign(b"payload", SECRET, 1_700_000_001).unwrap());
        assert_ne!(base, sign(b"payload", "whsec_other", 1_700_000_000).unwrap());
    }

    #[test]
    fn signature_header_carries_prefix() {
        let header = signature_header(b"payload", SECRET, 1_700_000_000).unwrap();
        assert!(header.starts_with("sha256="));
        assert_eq!(header.len(), "sha256=".len() + 64);
    }

    #[test]
    fn verify_accepts_fresh_signature() {
        let ts = 1_700_000_000;
        let header = signature_header(b"payload", SECRET, ts).unwrap();

        let result =
            verify(b"payload", SECRET, ts, &header, Duration::from_secs(300), ts + 10);
        assert!(result.is_valid);
    }

    #[test]
    fn verify_accepts_bare_hex() {
        let ts = 1_700_000_000;
        let sig = sign(b"payload", SECRET, ts).unwrap();

        let result = verify(b"payload", SECRET, ts, &sig, Duration::from_secs(300), ts);
        assert!(result.is_valid);
    }

    #[test]
    fn verify_rejects_stale_timestamp() {
        let ts = 1_700_000_000;
        let header = signature_header(b"payload", SECRET, ts).unwrap();

        let result =
            verify(b"payload", SECRET, ts, &header, Duration::from_secs(300), ts + 301);
        assert!(!result.is_valid);
        assert!(result.error_message.unwrap().contains("too old"));
    }

    #[test]
    fn verify_rejects_future_timestamp() {
        let ts = 1_700_000_000;
        let header = signature_header(b"payload", SECRET, ts).unwrap();

        let result =
            verify(b"payload", SECRET, ts, &header, Duration::from_secs(300), ts - 120);
        assert!(!result.is_valid);
    }

    #[test]
    fn verify_rejects_tampered_payload() {
        let ts = 1_700_000_000;
        let header = signature_header(b"payload", SECRET, ts).unwrap();

        let result =
            verify(b"tampered", SECRET, ts, &header, Duration::from_secs(300), ts);
        assert!(!result.is_valid);
        assert_eq!(result.error_message.unwrap(), "signature mismatch");
    }

    #[test]
    fn generated_secrets_have_expected_shape() {
        let secret = generate_secret();
        assert!(secret.starts_with(SECRET_PREFIX));
        assert_eq!(secret.len(), SECRET_PREFIX.len() + 64);
        assert_ne!(secret, generate_secret());
    }

    #[test]
    fn generated_delivery_keys_have_expected_shape() {
        let key = generate_delivery_key();
        assert!(key.starts_with(DELIVERY_KEY_PREFIX));
        assert_eq!(key.len(), DELIVERY_KEY_PREFIX.len() + 32);
        assert_ne!(key, generate_delivery_key());
    }

    #[test]
    fn build_headers_includes_reserved_set() {
        let headers = build_headers(
            b"payload",
            SECRET,
            "order.placed",
            "wh_abc",
            1_700_000_000,
            &HashMap::new(),
        )
        .unwrap();

        assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
        assert_eq!(headers.get("User-Agent").unwrap(), USER_AGENT);
        assert_eq!(headers.get(DELIVERY_ID_HEADER).unwrap(), "wh_abc");
        assert_eq!(headers.get(TIMESTAMP_HEADER).unwrap(), "1700000000");
        assert_eq!(headers.get(EVENT_TYPE_HEADER).unwrap(), "order.placed");
        assert!(headers.get(SIGNATURE_HEADER).unwrap().starts_with("sha256="));
    }

    #[test]
    fn custom_headers_merged_without_overriding_reserved() {
        let mut extra = HashMap::new();
        extra.insert("X-Custom".to_string(), "yes".to_string());
        extra.insert("x-herald-signature".to_string(), "forged".to_string());
        extra.insert("content-type".to_string(), "text/plain".to_string());

        let headers =
            build_headers(b"payload", SECRET, "order.placed", "wh_abc", 1_700_000_000, &extra)
                .unwrap();

        assert_eq!(headers.get("X-Custom").unwrap(), "yes");
        assert_eq!(headers.get("Content-Type").unwrap(), "application/json");
        assert!(headers.get(SIGNATURE_HEADER).unwrap().starts_with("sha256="));
        assert!(!headers.contains_key("x-herald-signature"));
        assert!(!headers.contains_key("content-type"));
    }

    #[test]
    fn secret_masking_keeps_prefix_and_suffix() {
        let masked = mask_secret("whsec_0123456789abcdef");
        assert_eq!(masked, "whsec_****cdef");
        assert!(!masked.contains("0123456789"));
    }

    #[test]
    fn sensitive_headers_redacted() {
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer token".to_string());
        headers.insert("X-Custom".to_string(), "visible".to_string());

        let redacted = redact_headers(&headers);
        assert_eq!(redacted.get("Authorization").unwrap(), "[redacted]");
        assert_eq!(redacted.get("X-Custom").unwrap(), "visible");
    }

    #[test]
    fn payload_hash_is_stable_sha256_hex() {
        let a = payload_hash(b"{}");
        let b = payload_hash(b"{}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, payload_hash(b"{ }"));
    }
}
