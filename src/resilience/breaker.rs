//! Per-source circuit breakers.
//!
//! A breaker fast-fails calls to a source that keeps failing, then lets a
//! trial call through once `recovery_timeout` has passed:
//!
//! ```text
//!            failures >= failure_threshold
//!   CLOSED ─────────────────────────────────▶ OPEN
//!     ▲                                        │
//!     │ successes >= success_threshold         │ recovery_timeout elapsed
//!     │                                        ▼
//!     └────────────────────────────────── HALF_OPEN
//!                                              │ any failure
//!                                              └──────────▶ OPEN
//! ```
//!
//! Timing uses [`tokio::time::Instant`] so tests can drive the recovery
//! window with a paused clock.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{Classify, ErrorKind};
use crate::config::BreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// Trial calls pass through; one failure reopens.
    HalfOpen,
}

impl CircuitState {
    /// Returns the state label used in logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open; the wrapped operation was not invoked.
    #[error("circuit open for {source_name}, retry in {}ms", .retry_in.as_millis())]
    Open {
        /// Source the breaker guards.
        source_name: String,
        /// Time left until a trial call is allowed.
        retry_in: Duration,
    },

    /// The wrapped operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns true when the call was rejected without running.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

impl<E: Classify> Classify for BreakerError<E> {
    fn error_kind(&self) -> ErrorKind {
        match self {
            // No upstream response to classify; falls under the short unknown retry budget.
            Self::Open { .. } => ErrorKind::Unknown,
            Self::Inner(inner) => inner.error_kind(),
        }
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted in CLOSED (or OPEN).
    pub failure_count: u32,
    /// Successful trial calls counted in HALF_OPEN.
    pub success_count: u32,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

/// Circuit breaker guarding one source.
#[derive(Debug)]
pub struct CircuitBreaker {
    source_name: String,
    failure_threshold: u32,
    success_threshold: u32,
    recovery_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for `source_name`.
    #[must_use]
    pub fn new(source_name: impl Into<String>, config: &BreakerConfig) -> Self {
        Self {
            source_name: source_name.into(),
            failure_threshold: config.failure_threshold.max(1),
            success_threshold: config.success_threshold.max(1),
            recovery_timeout: config.recovery_timeout(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Name of the guarded source.
    #[must_use]
    pub fn source_name(&self) -> &str {
        &self.source_name
    }

    /// Current state, without triggering the OPEN -> HALF_OPEN transition.
    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Current counters.
    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Runs `operation` through the breaker.
    ///
    /// # Errors
    ///
    /// Returns [`BreakerError::Open`] without invoking `operation` while the
    /// breaker is open, or [`BreakerError::Inner`] if `operation` fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.try_acquire().await?;

        match operation().await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(error) => {
                self.record_failure().await;
                Err(BreakerError::Inner(error))
            }
        }
    }

    /// Admits or rejects a call, moving OPEN to HALF_OPEN once recovery is due.
    async fn try_acquire<E>(&self) -> Result<(), BreakerError<E>> {
        let mut inner = self.inner.lock().await;
        if inner.state != CircuitState::Open {
            return Ok(());
        }

        let elapsed = inner
            .last_failure
            .map_or(self.recovery_timeout, |at| at.elapsed());
        if elapsed >= self.recovery_timeout {
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
            info!(source = %self.source_name, "circuit half-open, allowing trial call");
            return Ok(());
        }

        let retry_in = self.recovery_timeout.saturating_sub(elapsed);
        debug!(source = %self.source_name, retry_in_ms = retry_in.as_millis(), "circuit open, rejecting call");
        Err(BreakerError::Open {
            source_name: self.source_name.clone(),
            retry_in,
        })
    }

    /// Records a successful call.
    pub async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    info!(source = %self.source_name, "circuit closed");
                }
            }
            // A call admitted before the breaker opened; the open window stands.
            CircuitState::Open => {}
        }
    }

    /// Records a failed call.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.lock().await;
        inner.last_failure = Some(Instant::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.failure_threshold {
                    inner.state = CircuitState::Open;
                    warn!(
                        source = %self.source_name,
                        failures = inner.failure_count,
                        "circuit opened"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.success_count = 0;
                warn!(source = %self.source_name, "trial call failed, circuit reopened");
            }
            CircuitState::Open => inner.failure_count += 1,
        }
    }

    /// Forces the breaker back to CLOSED with zeroed counters.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.last_failure = None;
    }
}

/// Lazily created breakers, one per source name.
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    /// Creates an empty registry; breakers are built with `config`.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Returns the breaker for `source_name`, creating it on first use.
    #[must_use]
    pub fn get(&self, source_name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.get(source_name) {
            return Arc::clone(breaker.value());
        }
        let entry = self
            .breakers
            .entry(source_name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(source_name, &self.config)));
        Arc::clone(entry.value())
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
