//! Exponential backoff retry scheduling with jitter.
//!
//! Every failed attempt runs through [`RetryContext::decide`], which weighs
//! the error class and the remaining attempt budget and either schedules the
//! next try or gives the delivery up for dead-lettering. Delays grow
//! exponentially from a base, are capped, and carry symmetric jitter so a
//! recovering receiver is not hit by every stalled delivery at once.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::DeliveryError;

/// Largest exponent fed into the backoff power; past this the cap always
/// wins anyway.
const MAX_BACKOFF_EXPONENT: u32 = 32;

/// Backoff configuration applied between failed attempts.
///
/// The attempt budget itself is not part of the policy: each delivery
/// carries its own `max_attempts`, copied from the endpoint at creation
/// time, so one policy serves every endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Growth factor per attempt. Values below 1.0 are treated as 1.0.
    pub multiplier: f64,

    /// Cap on the computed delay, before jitter.
    pub max_delay: Duration,

    /// Symmetric jitter fraction (0.0 to 1.0) applied to the capped delay.
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(60),
            multiplier: 2.0,
            max_delay: Duration::from_secs(3600),
            jitter_fraction: 0.10,
        }
    }
}

impl RetryPolicy {
    /// Deterministic delay for a 1-based attempt number, before jitter:
    /// `min(base_delay * multiplier^(attempt_number - 1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        let scaled =
            self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());

        Duration::from_secs_f64(capped)
    }
}

/// Everything needed to decide whether a failed attempt retries.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// 1-based number of the attempt that just failed.
    pub attempt_number: u32,
    /// Attempt budget of the delivery, from its endpoint.
    pub max_attempts: u32,
    /// Error that failed the attempt.
    pub error: DeliveryError,
    /// Delay requested by the receiver via Retry-After, if any. Takes
    /// precedence over the computed backoff, without jitter.
    pub retry_after: Option<Duration>,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
    /// Backoff configuration to apply.
    pub policy: RetryPolicy,
}

/// Outcome of a retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Schedule the next attempt.
    Retry {
        /// When the scheduler should pick the delivery up again.
        next_retry_at: DateTime<Utc>,
    },
    /// Stop retrying; the delivery dead-letters.
    GiveUp {
        /// Why no further attempt will be made.
        reason: String,
    },
}

impl RetryContext {
    /// Creates a context with no server-requested delay.
    pub fn new(
        attempt_number: u32,
        max_attempts: u32,
        error: DeliveryError,
        failed_at: DateTime<Utc>,
        policy: RetryPolicy,
    ) -> Self {
        Self { attempt_number, max_attempts, error, retry_after: None, failed_at, policy }
    }

    /// Attaches a Retry-After delay read from the response headers.
    #[must_use]
    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    /// Decides whether the delivery retries and when.
    ///
    /// Gives up when the attempt budget is spent or the error class is
    /// permanent; otherwise schedules the next attempt relative to
    /// `failed_at`.
    pub fn decide(&self) -> RetryDecision {
        if self.attempt_number >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("attempt budget ({}) exhausted", self.max_attempts),
            };
        }

        if !self.error.is_retryable() {
            return RetryDecision::GiveUp {
                reason: format!("non-retryable error: {}", self.error),
            };
        }

        let delay = self.calculate_delay();
        let Ok(chrono_delay) = chrono::Duration::from_std(delay) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_retry_at: self.failed_at + chrono_delay }
    }

    /// Delay until the next attempt.
    ///
    /// A server-requested Retry-After wins outright and is used verbatim.
    /// Otherwise the policy's capped exponential delay applies, with
    /// jitter, so the result can exceed the cap by at most the jitter
    /// fraction.
    fn calculate_delay(&self) -> Duration {
        let requested = self
            .retry_after
            .or_else(|| self.error.retry_after_seconds().map(Duration::from_secs));
        if let Some(requested) = requested {
            return requested;
        }

        let capped = self.policy.delay_for_attempt(self.attempt_number);
        apply_jitter(capped, self.policy.jitter_fraction)
    }
}

/// Spreads a delay by up to ±`jitter_fraction` of itself.
fn apply_jitter(duration: Duration, jitter_fraction: f64) -> Duration {
    if jitter_fraction <= 0.0 {
        return duration;
    }

    let clamped = jitter_fraction.clamp(0.0, 1.0);

    let mut rng = rand::rng();
    let jitter_range = duration.as_secs_f64() * clamped;
    let offset = rng.random_range(-jitter_range..=jitter_range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}
