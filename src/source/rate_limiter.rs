//! Per-source rate limiting shared by every worker.
//!
//! This module provides the [`RateLimiter`] struct which enforces a minimum
//! interval between requests to the same source, no matter how many workers
//! (and therefore how many adapter instances) are talking to it at once.
//!
//! # Overview
//!
//! Limiting is keyed by source name, so requests to different sources proceed
//! in parallel without waiting for each other. A server-mandated delay
//! recorded with [`RateLimiter::record_rate_limit`] pushes back the next
//! permitted request for that source.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//! use harvester_core::source::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(Duration::from_secs(1)));
//!
//! // First request proceeds immediately
//! limiter.acquire("openalex").await;
//!
//! // Second request to the same source waits for the interval
//! limiter.acquire("openalex").await;
//!
//! // Request to a different source proceeds immediately
//! limiter.acquire("pubmed").await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::config::RateLimitConfig;

/// Warning threshold for cumulative delay per source (30 seconds).
const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-source rate limiter.
///
/// Designed to be wrapped in `Arc` and shared across worker tasks. `DashMap`
/// holds per-source state; a `tokio::sync::Mutex` per source makes the
/// read-wait-update of the request clock atomic.
#[derive(Debug)]
pub struct RateLimiter {
    /// Interval applied to sources without an override.
    default_interval: Duration,

    /// Per-source interval overrides.
    overrides: HashMap<String, Duration>,

    /// Whether rate limiting is disabled entirely.
    disabled: bool,

    /// Per-source state. `Arc` lets us drop the shard lock before awaiting.
    sources: DashMap<String, Arc<SourceState>>,
}

#[derive(Debug, Default)]
struct RequestClock {
    /// `None` until the first request (which is never delayed).
    last_request: Option<Instant>,
    /// Server-mandated earliest time for the next request.
    not_before: Option<Instant>,
}

#[derive(Debug, Default)]
struct SourceState {
    clock: Mutex<RequestClock>,
    cumulative_delay_ms: AtomicU64,
}

impl SourceState {
    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }
}

impl RateLimiter {
    /// Creates a rate limiter with one interval for every source.
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = default_interval.as_millis()))]
    pub fn new(default_interval: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            default_interval,
            overrides: HashMap::new(),
            disabled: default_interval.is_zero(),
            sources: DashMap::new(),
        }
    }

    /// Creates a disabled rate limiter that applies no delays.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Builds a limiter from configuration, including per-source overrides.
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let mut limiter = Self::new(Duration::from_millis(config.default_interval_ms));
        for (source, interval_ms) in &config.per_source {
            limiter = limiter.with_source_interval(source, Duration::from_millis(*interval_ms));
        }
        limiter
    }

    /// Overrides the interval for one source.
    #[must_use]
    pub fn with_source_interval(mut self, source: &str, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.disabled = false;
        }
        self.overrides.insert(source.to_string(), interval);
        self
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the interval enforced for `source`.
    #[must_use]
    pub fn interval_for(&self, source: &str) -> Duration {
        self.overrides
            .get(source)
            .copied()
            .unwrap_or(self.default_interval)
    }

    fn state(&self, source: &str) -> Arc<SourceState> {
        self.sources
            .entry(source.to_string())
            .or_default()
            .clone()
    }

    /// Waits until a request to `source` is permitted, then claims the slot.
    ///
    /// The first request to any source proceeds immediately unless a
    /// server-mandated delay has been recorded for it. A disabled limiter
    /// skips interval spacing but still honors server-mandated delays.
    #[instrument(skip(self))]
    pub async fn acquire(&self, source: &str) {
        let interval = if self.disabled {
            Duration::ZERO
        } else {
            self.interval_for(source)
        };
        let state = self.state(source);

        // Only the per-source Mutex is held across the sleep.
        let mut clock = state.clock.lock().await;

        let now = Instant::now();
        let mut ready_at = clock
            .last_request
            .map_or(now, |last| (last + interval).max(now));
        if let Some(not_before) = clock.not_before.take() {
            ready_at = ready_at.max(not_before);
        }

        if ready_at > now {
            let delay = ready_at - now;
            let cumulative = state.add_cumulative_delay(delay);

            debug!(
                source,
                delay_ms = delay.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "applying rate limit delay"
            );

            if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
                warn!(
                    source,
                    cumulative_delay_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider reducing request volume to this source"
                );
            }

            tokio::time::sleep_until(ready_at).await;
        }

        clock.last_request = Some(Instant::now());
    }

    /// Records a server-mandated delay (e.g. from a Retry-After header).
    ///
    /// The next [`RateLimiter::acquire`] for `source` will not return before
    /// `delay` has elapsed from now.
    #[instrument(skip(self), fields(delay_ms = delay.as_millis()))]
    pub async fn record_rate_limit(&self, source: &str, delay: Duration) {
        let state = self.state(source);
        let cumulative = state.add_cumulative_delay(delay);
        {
            let mut clock = state.clock.lock().await;
            let until = Instant::now() + delay;
            clock.not_before = Some(clock.not_before.map_or(until, |existing| existing.max(until)));
        }

        debug!(
            source,
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );

        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                source,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - source may be under heavy load"
            );
        }
    }

    /// Total delay imposed on `source` so far.
    #[must_use]
    pub fn cumulative_delay(&self, source: &str) -> Duration {
        self.sources.get(source).map_or(Duration::ZERO, |state| {
            Duration::from_millis(state.cumulative_delay_ms.load(Ordering::SeqCst))
        })
    }
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports two formats as per RFC 7231:
/// - Integer seconds: `Retry-After: 120`
/// - HTTP-date: `Retry-After: Wed, 21 Oct 2025 07:28:00 GMT`
///
/// Returns `None` if the value cannot be parsed. Caps excessive values at 1 hour.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use harvester_core::source::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("0"), Some(Duration::ZERO));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        if seconds < 0 {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        }

        #[allow(clippy::cast_sign_loss)]
        let duration = Duration::from_secs(seconds as u64);

        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }

        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };

    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) if duration > MAX_RETRY_AFTER => Some(MAX_RETRY_AFTER),
        Ok(duration) => Some(duration),
        // Date is in the past
        Err(_) => Some(Duration::ZERO),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_disabled_when_interval_zero() {
        assert!(RateLimiter::disabled().is_disabled());
        assert!(!RateLimiter::new(Duration::from_millis(500)).is_disabled());
    }

    #[test]
    fn test_from_config_applies_overrides() {
        let mut config = RateLimitConfig::default();
        config.per_source.insert("pubmed".to_string(), 334);
        let limiter = RateLimiter::from_config(&config);

        assert_eq!(limiter.interval_for("pubmed"), Duration::from_millis(334));
        assert_eq!(limiter.interval_for("arxiv"), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_limiter_never_waits() {
        let limiter = RateLimiter::disabled();
        let start = Instant::now();

        limiter.acquire("openalex").await;
        limiter.acquire("openalex").await;
        limiter.acquire("openalex").await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_limiter_still_honors_retry_after() {
        let limiter = RateLimiter::disabled();
        limiter.record_rate_limit("crossref", Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.acquire("crossref").await;
        assert!(start.elapsed() >= Duration::from_secs(5));

        // The mandated delay is consumed once.
        let after = Instant::now();
        limiter.acquire("crossref").await;
        assert!(after.elapsed() < Duration::from_millis(10));

        // Other sources are unaffected.
        limiter.acquire("pubmed").await;
        assert!(after.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_source_requests_are_spaced() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let start = Instant::now();

        limiter.acquire("openalex").await;
        assert!(start.elapsed() < Duration::from_millis(10));

        limiter.acquire("openalex").await;
        assert!(start.elapsed() >= Duration::from_secs(1));
        assert!(start.elapsed() < Duration::from_millis(1100));

        limiter.acquire("openalex").await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_different_sources_are_independent() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        let start = Instant::now();

        limiter.acquire("openalex").await;
        limiter.acquire("pubmed").await;
        limiter.acquire("arxiv").await;

        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_limiter_spaces_concurrent_callers() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(500)));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let limiter = Arc::clone(&limiter);
            handles.push(tokio::spawn(async move {
                limiter.acquire("crossref").await;
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Three requests need two full intervals between them.
        assert!(start.elapsed() >= Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_rate_limit_delays_next_acquire() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        limiter.record_rate_limit("crossref", Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.acquire("crossref").await;
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(limiter.cumulative_delay("crossref"), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cumulative_delay_tracked_per_source() {
        let limiter = RateLimiter::new(Duration::from_secs(1));
        limiter.record_rate_limit("a", Duration::from_secs(5)).await;
        limiter.record_rate_limit("b", Duration::from_secs(10)).await;

        assert_eq!(limiter.cumulative_delay("a"), Duration::from_secs(5));
        assert_eq!(limiter.cumulative_delay("b"), Duration::from_secs(10));
        assert_eq!(limiter.cumulative_delay("never-seen"), Duration::ZERO);
    }

    // ==================== parse_retry_after Tests ====================

    #[test]
    fn test_parse_retry_after_seconds() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("  120  "), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_parse_retry_after_rejects_garbage() {
        assert_eq!(parse_retry_after("-5"), None);
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn test_parse_retry_after_caps_at_one_hour() {
        assert_eq!(parse_retry_after("7200"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_parse_retry_after_http_date_past_is_zero() {
        assert_eq!(
            parse_retry_after("Wed, 01 Jan 2020 00:00:00 GMT"),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_parse_retry_after_http_date_future() {
        let future_time = std::time::SystemTime::now() + Duration::from_secs(60);
        let future_date = httpdate::fmt_http_date(future_time);

        let duration = parse_retry_after(&future_date).unwrap();
        assert!(
            duration >= Duration::from_secs(55) && duration <= Duration::from_secs(65),
            "Duration should be ~60s, got {duration:?}"
        );
    }
}
