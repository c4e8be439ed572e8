//! Error types for queue operations.

use thiserror::Error;

use super::TaskId;
use crate::db::DbErrorKind;

/// Errors that can occur during queue operations.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification used for failure handling.
        kind: DbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// Pending ordering is full.
    #[error(
        "queue is full ({max} pending tasks)\n  Suggestion: Wait for workers to drain the queue or raise queue.max_size"
    )]
    Capacity {
        /// Configured maximum pending size.
        max: usize,
    },

    /// Task id is already queued.
    #[error("task already exists: {0}")]
    DuplicateTask(TaskId),

    /// Invalid status value.
    #[error(
        "invalid status '{status}': {reason}\n  Suggestion: Use one of: pending, running, completed, cached, failed, cancelled"
    )]
    InvalidStatus {
        /// The invalid status value
        status: String,
        /// Why it's invalid
        reason: String,
    },

    /// A stored task could not be encoded or decoded.
    #[error("failed to (de)serialize task {task_id}: {message}")]
    Serialization {
        /// Task the value belongs to.
        task_id: String,
        /// What went wrong.
        message: String,
    },
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: DbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl QueueError {
    /// Creates an `InvalidStatus` error for an unrecognized status string.
    #[must_use]
    pub fn invalid_status(status: &str) -> Self {
        Self::InvalidStatus {
            status: status.to_string(),
            reason: "unrecognized status value".to_string(),
        }
    }

    pub(crate) fn serialization(task_id: impl ToString, message: impl ToString) -> Self {
        Self::Serialization {
            task_id: task_id.to_string(),
            message: message.to_string(),
        }
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<DbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            Self::Capacity { .. }
            | Self::DuplicateTask(_)
            | Self::InvalidStatus { .. }
            | Self::Serialization { .. } => None,
        }
    }

    /// Returns true when retrying the same operation shortly may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.database_kind().is_some_and(DbErrorKind::is_transient)
    }
}
