//! Retry eligibility and kind-specific backoff with jitter.
//!
//! # Delay Calculation
//!
//! With `attempt` 1-indexed and `base`/`max` from [`BackoffConfig`]:
//!
//! ```text
//! RateLimit: min(base * 2^attempt,   max)   aggressive exponential
//! Network:   min(base * attempt,     max)   linear
//! ApiError:  min(base * 1.5^attempt, max)   moderate exponential
//! Unknown:   min(base * 3^attempt,   max)   conservative exponential
//! ```
//!
//! A uniform ±10% jitter is then applied and the result clamped to
//! `[100ms, max]`, so workers that failed together don't retry together.
//!
//! # Example
//!
//! ```
//! use harvester_core::resilience::{ErrorKind, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::default();
//! match policy.should_retry(ErrorKind::Network, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         println!("attempt {attempt} in {delay:?}");
//!     }
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::ErrorKind;
use crate::config::{BackoffConfig, DEFAULT_MAX_ATTEMPTS};

/// Lower bound on any jittered delay.
pub const MIN_DELAY: Duration = Duration::from_millis(100);

/// Jitter amplitude as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.1;

/// Attempts on which [`ErrorKind::Unknown`] is still retried.
const UNKNOWN_RETRY_ATTEMPTS: u32 = 2;

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// The attempt number the retry will be (1-indexed).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason, stored with the task's error.
        reason: String,
    },
}

/// In-worker retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the first.
    max_attempts: u32,
    /// Base delay for the per-kind formulas.
    base_delay: Duration,
    /// Cap on any delay.
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(DEFAULT_MAX_ATTEMPTS, &BackoffConfig::default())
    }
}

impl RetryPolicy {
    /// Creates a policy with explicit bounds.
    #[must_use]
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Builds a policy from worker and backoff configuration.
    #[must_use]
    pub fn from_config(max_attempts: u32, backoff: &BackoffConfig) -> Self {
        Self::new(
            max_attempts,
            Duration::from_millis(backoff.base_delay_ms),
            Duration::from_millis(backoff.max_delay_ms),
        )
    }

    /// Returns the maximum number of attempts configured.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Returns the delay cap.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// Whether a failure of `kind` on `attempt` may be retried.
    #[must_use]
    pub fn is_retryable(&self, kind: ErrorKind, attempt: u32) -> bool {
        if attempt >= self.max_attempts {
            return false;
        }
        match kind {
            ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::ApiError => true,
            ErrorKind::Parse | ErrorKind::Validation => false,
            ErrorKind::Unknown => attempt <= UNKNOWN_RETRY_ATTEMPTS,
        }
    }

    /// Decides whether to retry after `attempt` (1-indexed) failed with `kind`.
    #[instrument(skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        if !self.is_retryable(kind, attempt) {
            let reason = match kind {
                ErrorKind::Parse | ErrorKind::Validation => {
                    format!("{kind} errors are not retryable")
                }
                ErrorKind::Unknown if attempt < self.max_attempts => format!(
                    "unknown errors are only retried on the first {UNKNOWN_RETRY_ATTEMPTS} attempts"
                ),
                _ => format!("max attempts ({}) exhausted", self.max_attempts),
            };
            debug!(%kind, attempt, %reason, "not retrying");
            return RetryDecision::DoNotRetry { reason };
        }

        let delay = self.delay_for(kind, attempt);
        debug!(
            %kind,
            attempt,
            next_attempt = attempt + 1,
            delay_ms = delay.as_millis(),
            "will retry"
        );
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    /// Un-jittered delay for `kind` after `attempt`, capped at the max delay.
    #[must_use]
    pub fn base_delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64();
        let n = f64::from(attempt);
        let secs = match kind {
            ErrorKind::RateLimit => base * 2f64.powf(n),
            ErrorKind::Network => base * n,
            ErrorKind::ApiError => base * 1.5f64.powf(n),
            ErrorKind::Unknown => base * 3f64.powf(n),
            ErrorKind::Parse | ErrorKind::Validation => base,
        };
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Jittered delay for `kind` after `attempt`, within `[MIN_DELAY, max_delay]`.
    #[must_use]
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
        self.apply_jitter(self.base_delay_for(kind, attempt), jitter)
    }

    fn apply_jitter(&self, delay: Duration, jitter: f64) -> Duration {
        let jittered = delay.as_secs_f64() * (1.0 + jitter);
        let capped = jittered.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(MIN_DELAY.as_secs_f64()))
    }
}
