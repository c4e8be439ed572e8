//! Failure handling: classification, retry backoff and circuit breakers.
//!
//! - [`classify`] reduces errors to an [`ErrorKind`]
//! - [`backoff`] decides retry eligibility and delay per kind
//! - [`breaker`] fast-fails sources that keep failing

pub mod backoff;
pub mod breaker;
pub mod classify;

pub use backoff::{MIN_DELAY, RetryDecision, RetryPolicy};
pub use breaker::{BreakerError, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use classify::{Classify, ErrorKind, classify_error, classify_http_status};
