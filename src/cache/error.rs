//! Error types for cache operations.

use thiserror::Error;

use crate::db::DbErrorKind;

/// Errors that can occur during cache operations.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Database operation failed.
    #[error("cache database error ({kind}): {message}")]
    Database {
        /// Typed classification of the driver failure.
        kind: DbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// A record payload could not be encoded or decoded.
    #[error("failed to (de)serialize cached record: {0}")]
    Serialization(String),

    /// Referenced query was never registered.
    #[error(
        "unknown query id: {0}\n  Suggestion: Call register_query before caching pages or records"
    )]
    UnknownQuery(String),

    /// A stored value does not fit the expected type.
    #[error("corrupt cache row for query {query_id}: {reason}")]
    Corrupt {
        /// Query the row belongs to.
        query_id: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl CacheError {
    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<DbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::Serialization(_) | Self::UnknownQuery(_) | Self::Corrupt { .. } => None,
        }
    }

    /// Returns true for busy/locked or pool-timeout database failures.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.database_kind().is_some_and(DbErrorKind::is_transient)
    }
}
