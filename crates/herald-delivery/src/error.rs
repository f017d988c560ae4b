//! Error types for the delivery pipeline.
//!
//! Every failed attempt resolves to a [`DeliveryError`], and the variant
//! decides what happens next: retryable errors send the delivery back
//! through the backoff schedule, non-retryable ones dead-letter it. The
//! [`ErrorCategory`] is the machine-readable label persisted on the ledger
//! and attempt log.

use std::time::Duration;

use herald_core::CoreError;
use thiserror::Error;

/// Result type for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors that can occur while delivering a webhook.
#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    /// Connection-level failure before any response arrived.
    #[error("connection error: {message}")]
    Network {
        /// Description of the network failure.
        message: String,
    },

    /// The request exceeded the endpoint's configured timeout.
    #[error("request timed out after {timeout_seconds}s")]
    Timeout {
        /// Timeout that was exceeded, in seconds.
        timeout_seconds: u64,
    },

    /// Receiver answered with a 4xx status.
    #[error("receiver returned client error {status_code}")]
    ClientError {
        /// HTTP status code received.
        status_code: u16,
    },

    /// Receiver answered with a 5xx status.
    #[error("receiver returned server error {status_code}")]
    ServerError {
        /// HTTP status code received.
        status_code: u16,
    },

    /// Receiver answered 429.
    #[error("receiver rate limited the delivery")]
    RateLimited {
        /// Retry-After hint from the response, if the receiver sent one.
        retry_after_seconds: Option<u64>,
    },

    /// Receiver answered with a status outside 2xx-5xx.
    #[error("receiver returned unexpected status {status_code}")]
    UnexpectedStatus {
        /// HTTP status code received.
        status_code: u16,
    },

    /// The ledger or registry failed or refused an operation.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
    },

    /// The delivery references configuration that is invalid or missing.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// A scheduler worker panicked.
    #[error("worker {worker_id} panicked: {message}")]
    WorkerPanic {
        /// Index of the worker that panicked.
        worker_id: usize,
        /// Panic message, if one could be recovered.
        message: String,
    },

    /// Workers did not stop within the shutdown grace period.
    #[error("shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Grace period that elapsed.
        timeout: Duration,
    },

    /// Invariant violation inside the pipeline.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violation.
        message: String,
    },
}

impl DeliveryError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network { message: message.into() }
    }

    /// Creates a timeout error.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout { timeout_seconds: timeout.as_secs() }
    }

    /// Creates a storage error.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Classifies a received HTTP status. Returns `None` for 2xx.
    ///
    /// `retry_after_seconds` is only attached when the status is 429.
    pub fn from_response_status(
        status_code: u16,
        retry_after_seconds: Option<u64>,
    ) -> Option<Self> {
        match status_code {
            200..=299 => None,
            429 => Some(Self::RateLimited { retry_after_seconds }),
            400..=499 => Some(Self::ClientError { status_code }),
            500..=599 => Some(Self::ServerError { status_code }),
            _ => Some(Self::UnexpectedStatus { status_code }),
        }
    }

    /// Whether the failed attempt should be retried.
    ///
    /// Responses retry on 408, 429, and any 5xx; other received statuses
    /// are permanent. When no response arrived at all (timeout, connection
    /// error) the attempt is always retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::ServerError { .. }
            | Self::RateLimited { .. }
            | Self::Storage { .. } => true,
            // 408 is the receiver timing the request out; retries like a timeout.
            Self::ClientError { status_code: 408 } => true,
            Self::ClientError { .. }
            | Self::UnexpectedStatus { .. }
            | Self::Configuration { .. }
            | Self::WorkerPanic { .. }
            | Self::ShutdownTimeout { .. }
            | Self::Internal { .. } => false,
        }
    }

    /// Server-requested retry delay, if the receiver sent one.
    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_seconds } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Machine-readable category for ledger and attempt records.
    pub fn category(&self) -> ErrorCategory {
        ErrorCategory::from(self)
    }
}

impl From<CoreError> for DeliveryError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Database(message) | CoreError::ConstraintViolation(message) => {
                Self::Storage { message }
            }
            CoreError::NotFound(message) | CoreError::Validation(message) => {
                Self::Configuration { message }
            }
        }
    }
}

/// Coarse error classification stored alongside failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Request timed out before a response arrived.
    Timeout,
    /// Connection could not be established or was dropped.
    Connection,
    /// Receiver rejected the request with a permanent 4xx.
    ClientError,
    /// Receiver failed with a 5xx.
    ServerError,
    /// Receiver asked us to back off.
    RateLimited,
    /// Ledger or registry failure.
    Storage,
    /// Invalid or missing delivery configuration.
    Configuration,
    /// Pipeline-internal failure.
    Internal,
}

impl From<&DeliveryError> for ErrorCategory {
    fn from(err: &DeliveryError) -> Self {
        match err {
            DeliveryError::Timeout { .. } => Self::Timeout,
            DeliveryError::Network { .. } => Self::Connection,
            DeliveryError::ClientError { .. } | DeliveryError::UnexpectedStatus { .. } => {
                Self::ClientError
            }
            DeliveryError::ServerError { .. } => Self::ServerError,
            DeliveryError::RateLimited { .. } => Self::RateLimited,
            DeliveryError::Storage { .. } => Self::Storage,
            DeliveryError::Configuration { .. } => Self::Configuration,
            DeliveryError::WorkerPanic { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::Internal { .. } => Self::Internal,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Timeout => "timeout",
            Self::Connection => "connection",
            Self::ClientError => "client_error",
            Self::ServerError => "server_error",
            Self::RateLimited => "rate_limited",
            Self::Storage => "storage",
            Self::Configuration => "configuration",
            Self::Internal => "internal",
        };
        write!(f, "{label}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_timeouts_are_retryable() {
        assert!(DeliveryError::ServerError { status_code: 500 }.is_retryable());
        assert!(DeliveryError::ServerError { status_code: 503 }.is_retryable());
        assert!(DeliveryError::timeout(Duration::from_secs(5)).is_retryable());
        assert!(DeliveryError::network("connection refused").is_retryable());
        assert!(
            DeliveryError::RateLimited { retry_after_seconds: Some(30) }.is_retryable()
        );
    }

    #[test]
    fn request_timeout_status_is_retryable() {
        assert!(DeliveryError::ClientError { status_code: 408 }.is_retryable());
    }

    #[test]
    fn permanent_client_errors_are_not_retryable() {
        assert!(!DeliveryError::ClientError { status_code: 400 }.is_retryable());
        assert!(!DeliveryError::ClientError { status_code: 404 }.is_retryable());
        assert!(!DeliveryError::ClientError { status_code: 410 }.is_retryable());
        assert!(!DeliveryError::UnexpectedStatus { status_code: 301 }.is_retryable());
        assert!(!DeliveryError::configuration("missing endpoint").is_retryable());
    }

    #[test]
    fn status_classification_matches_ranges() {
        assert!(DeliveryError::from_response_status(200, None).is_none());
        assert!(DeliveryError::from_response_status(204, None).is_none());

        match DeliveryError::from_response_status(429, Some(10)) {
            Some(DeliveryError::RateLimited { retry_after_seconds: Some(10) }) => {}
            other => panic!("expected RateLimited, got {other:?}"),
        }
        match DeliveryError::from_response_status(404, None) {
            Some(DeliveryError::ClientError { status_code: 404 }) => {}
            other => panic!("expected ClientError, got {other:?}"),
        }
        match DeliveryError::from_response_status(502, None) {
            Some(DeliveryError::ServerError { status_code: 502 }) => {}
            other => panic!("expected ServerError, got {other:?}"),
        }
        match DeliveryError::from_response_status(302, None) {
            Some(DeliveryError::UnexpectedStatus { status_code: 302 }) => {}
            other => panic!("expected UnexpectedStatus, got {other:?}"),
        }
    }

    #[test]
    fn categories_render_snake_case() {
        assert_eq!(
            DeliveryError::timeout(Duration::from_secs(5)).category().to_string(),
            "timeout"
        );
        assert_eq!(DeliveryError::network("refused").category().to_string(), "connection");
        assert_eq!(
            DeliveryError::ClientError { status_code: 404 }.category().to_string(),
            "client_error"
        );
        assert_eq!(
            DeliveryError::ServerError { status_code: 500 }.category().to_string(),
            "server_error"
        );
        assert_eq!(
            DeliveryError::RateLimited { retry_after_seconds: None }.category().to_string(),
            "rate_limited"
        );
        assert_eq!(DeliveryError::internal("bug").category().to_string(), "internal");
    }

    #[test]
    fn retry_after_only_surfaces_for_rate_limits() {
        let limited = DeliveryError::RateLimited { retry_after_seconds: Some(120) };
        assert_eq!(limited.retry_after_seconds(), Some(120));

        let server = DeliveryError::ServerError { status_code: 503 };
        assert_eq!(server.retry_after_seconds(), None);
    }

    #[test]
    fn core_errors_map_to_storage_or_configuration() {
        let db = CoreError::Database("pool exhausted".into());
        match DeliveryError::from(db) {
            DeliveryError::Storage { .. } => {}
            other => panic!("expected Storage, got {other:?}"),
        }

        let missing = CoreError::not_found("endpoint", "abc");
        match DeliveryError::from(missing) {
            DeliveryError::Configuration { .. } => {}
            other => panic!("expected Configuration, got {other:?}"),
        }
    }
}
