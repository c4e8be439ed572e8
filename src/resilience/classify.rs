//! Error classification for retry decisions.
//!
//! Every failure that reaches the worker's attempt loop is reduced to an
//! [`ErrorKind`]. The kind alone decides retry eligibility and which backoff
//! curve applies (see [`super::RetryPolicy`]).
//!
//! # HTTP Status Classification
//!
//! | Status | Kind | Rationale |
//! |--------|------|-----------|
//! | 408 | Network | Request timeout - transport level |
//! | 429 | RateLimit | Too many requests - back off hard |
//! | other 4xx | ApiError | Upstream rejected the request |
//! | 5xx | ApiError | Upstream failure |
//! | anything else | Unknown | Not an error status we understand |

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::source::SourceError;

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Upstream rate limiting (HTTP 429). Retried with aggressive exponential backoff.
    RateLimit,
    /// Connect failures and timeouts. Retried with linear backoff.
    Network,
    /// Other upstream 4xx/5xx. Retried except on the final attempt.
    ApiError,
    /// Malformed upstream data. Never retried.
    Parse,
    /// Bad input or configuration. Never retried.
    Validation,
    /// Anything else. Retried only on the first two attempts.
    Unknown,
}

impl ErrorKind {
    /// Returns the stable label used in logs and stored error messages.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::Network => "network",
            Self::ApiError => "api_error",
            Self::Parse => "parse_error",
            Self::Validation => "validation",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can be reduced to an [`ErrorKind`].
pub trait Classify {
    /// Returns the retry classification of this error.
    fn error_kind(&self) -> ErrorKind;
}

impl Classify for SourceError {
    fn error_kind(&self) -> ErrorKind {
        classify_error(self)
    }
}

/// Classifies a source error into an [`ErrorKind`].
#[must_use]
pub fn classify_error(error: &SourceError) -> ErrorKind {
    match error {
        SourceError::RateLimited { .. } => ErrorKind::RateLimit,
        SourceError::HttpStatus { status, .. } => classify_http_status(*status),
        SourceError::Network { .. } | SourceError::Timeout { .. } => ErrorKind::Network,
        SourceError::Parse { .. } => ErrorKind::Parse,
        SourceError::Validation { .. } => ErrorKind::Validation,
        SourceError::Other { .. } => ErrorKind::Unknown,
    }
}

/// Classifies an HTTP status code.
#[must_use]
pub fn classify_http_status(status: u16) -> ErrorKind {
    match status {
        408 => ErrorKind::Network,
        429 => ErrorKind::RateLimit,
        400..=599 => ErrorKind::ApiError,
        _ => ErrorKind::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limited() {
        let err = SourceError::rate_limited("crossref", None);
        assert_eq!(classify_error(&err), ErrorKind::RateLimit);
        assert_eq!(
            classify_error(&SourceError::http_status("crossref", 429)),
            ErrorKind::RateLimit
        );
    }

    #[test]
    fn test_classify_transport_failures_as_network() {
        assert_eq!(
            classify_error(&SourceError::network("a", "connection refused")),
            ErrorKind::Network
        );
        assert_eq!(classify_error(&SourceError::timeout("a")), ErrorKind::Network);
        assert_eq!(
            classify_error(&SourceError::http_status("a", 408)),
            ErrorKind::Network
        );
    }

    #[test]
    fn test_classify_other_statuses_as_api_error() {
        for status in [400, 401, 403, 404, 500, 502, 503, 504] {
            assert_eq!(
                classify_error(&SourceError::http_status("a", status)),
                ErrorKind::ApiError,
                "status {status}"
            );
        }
    }

    #[test]
    fn test_classify_non_error_status_as_unknown() {
        assert_eq!(classify_http_status(302), ErrorKind::Unknown);
    }

    #[test]
    fn test_classify_data_errors_never_retryable_kinds() {
        assert_eq!(
            classify_error(&SourceError::parse("a", "bad xml")),
            ErrorKind::Parse
        );
        assert_eq!(
            classify_error(&SourceError::validation("a", "empty query")),
            ErrorKind::Validation
        );
        assert_eq!(
            SourceError::other("a", "weird").error_kind(),
            ErrorKind::Unknown
        );
    }

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(ErrorKind::RateLimit.to_string(), "rate_limit");
        assert_eq!(ErrorKind::Parse.as_str(), "parse_error");
    }
}
