//! Typed errors raised by record source adapters.
//!
//! Every adapter failure must land in one of these variants so the worker
//! pool can classify it for retry decisions. Adapters built on `reqwest`
//! can use [`SourceError::from_reqwest`] and [`SourceError::check_response`]
//! instead of mapping errors by hand.

use std::time::Duration;

use thiserror::Error;

use super::rate_limiter::parse_retry_after;

/// Errors that can occur while streaming records from a source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The upstream API asked us to slow down (HTTP 429 or equivalent).
    #[error("rate limited by {source_name}{}", retry_hint(.retry_after))]
    RateLimited {
        /// Source that rejected the request.
        source_name: String,
        /// Server-mandated wait, when the response carried one.
        retry_after: Option<Duration>,
    },

    /// Non-success HTTP status other than rate limiting.
    #[error("HTTP {status} from {source_name}")]
    HttpStatus {
        /// Source that returned the status.
        source_name: String,
        /// The HTTP status code.
        status: u16,
        /// Retry-After value, when present.
        retry_after: Option<Duration>,
    },

    /// Connection-level failure (DNS, refused, reset, TLS).
    #[error("network error talking to {source_name}: {message}")]
    Network {
        /// Source being contacted.
        source_name: String,
        /// Underlying error text.
        message: String,
    },

    /// Request timed out.
    #[error("timeout talking to {source_name}")]
    Timeout {
        /// Source being contacted.
        source_name: String,
    },

    /// Response body could not be decoded into records.
    #[error("failed to parse response from {source_name}: {message}")]
    Parse {
        /// Source that produced the malformed payload.
        source_name: String,
        /// What was wrong with it.
        message: String,
    },

    /// The request itself is unusable (bad query, unknown source, bad config).
    #[error("invalid request for {source_name}: {message}\n  Suggestion: fix the search parameters; retrying will not help")]
    Validation {
        /// Source the request targeted.
        source_name: String,
        /// What was rejected.
        message: String,
    },

    /// Anything the adapter could not classify.
    #[error("{source_name} failed: {message}")]
    Other {
        /// Source that failed.
        source_name: String,
        /// Error text.
        message: String,
    },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |delay| {
        format!(" (retry after {}s)", delay.as_secs())
    })
}

impl SourceError {
    /// Creates a rate-limited error.
    pub fn rate_limited(source_name: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            source_name: source_name.into(),
            retry_after,
        }
    }

    /// Creates an HTTP status error. Status 429 becomes [`SourceError::RateLimited`].
    pub fn http_status(source_name: impl Into<String>, status: u16) -> Self {
        Self::http_status_with_retry_after(source_name, status, None)
    }

    /// Creates an HTTP status error carrying a Retry-After delay.
    pub fn http_status_with_retry_after(
        source_name: impl Into<String>,
        status: u16,
        retry_after: Option<Duration>,
    ) -> Self {
        if status == 429 {
            return Self::rate_limited(source_name, retry_after);
        }
        Self::HttpStatus {
            source_name: source_name.into(),
            status,
            retry_after,
        }
    }

    /// Creates a network error.
    pub fn network(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Network {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(source_name: impl Into<String>) -> Self {
        Self::Timeout {
            source_name: source_name.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Creates a validation error.
    pub fn validation(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Creates an unclassified error.
    pub fn other(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Other {
            source_name: source_name.into(),
            message: message.into(),
        }
    }

    /// Returns the name of the source that raised this error.
    #[must_use]
    pub fn source_name(&self) -> &str {
        match self {
            Self::RateLimited { source_name, .. }
            | Self::HttpStatus { source_name, .. }
            | Self::Network { source_name, .. }
            | Self::Timeout { source_name }
            | Self::Parse { source_name, .. }
            | Self::Validation { source_name, .. }
            | Self::Other { source_name, .. } => source_name,
        }
    }

    /// Returns the server-mandated retry delay, if the error carries one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } | Self::HttpStatus { retry_after, .. } => {
                *retry_after
            }
            _ => None,
        }
    }

    /// Maps a `reqwest` failure into a classifiable source error.
    #[must_use]
    pub fn from_reqwest(source_name: &str, error: &reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::timeout(source_name);
        }
        if let Some(status) = error.status() {
            return Self::http_status(source_name, status.as_u16());
        }
        if error.is_decode() {
            return Self::parse(source_name, error.to_string());
        }
        if error.is_connect() || error.is_request() || error.is_body() {
            return Self::network(source_name, error.to_string());
        }
        if error.is_builder() {
            return Self::validation(source_name, error.to_string());
        }
        Self::other(source_name, error.to_string())
    }

    /// Passes successful responses through and turns error statuses into
    /// [`SourceError`], honoring the `Retry-After` header.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::RateLimited`] for 429 and
    /// [`SourceError::HttpStatus`] for any other non-success status.
    pub fn check_response(
        source_name: &str,
        response: reqwest::Response,
    ) -> Result<reqwest::Response, Self> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_retry_after);

        Err(Self::http_status_with_retry_after(
            source_name,
            status.as_u16(),
            retry_after,
        ))
    }
}
