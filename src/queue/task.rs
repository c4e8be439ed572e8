//! Task types and status definitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::DEFAULT_MAX_RETRIES;
use crate::source::{FetchRequest, Record};

/// Opaque unique task identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the pending ordering.
    Pending,
    /// Claimed by a worker.
    Running,
    /// Fetched from the source.
    Completed,
    /// Served from a completed cache entry.
    Cached,
    /// Failed after exhausting its requeue budget.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
}

impl TaskStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cached => "cached",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Returns true for statuses a task never leaves.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cached | Self::Failed | Self::Cancelled
        )
    }

    /// Returns true when the task finished with results.
    #[must_use]
    pub fn has_results(&self) -> bool {
        matches!(self, Self::Completed | Self::Cached)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "cached" => Ok(Self::Cached),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid task status: {s}")),
        }
    }
}

/// One unit of scheduled work: fetch all records for a query from a source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    /// Unique identifier.
    pub id: TaskId,
    /// Source adapter name.
    pub source: String,
    /// Query text.
    pub query: String,
    /// Inclusive lower date bound.
    pub start_date: Option<NaiveDate>,
    /// Inclusive upper date bound.
    pub end_date: Option<NaiveDate>,
    /// Stop after this many records.
    pub limit: Option<usize>,
    /// Lower runs first.
    pub priority: i64,
    /// Source-specific adapter configuration.
    pub config: Map<String, Value>,
    /// Lifecycle status.
    pub status: TaskStatus,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When a worker last claimed the task.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached COMPLETED or CACHED.
    pub completed_at: Option<DateTime<Utc>>,
    /// Collected records.
    pub records: Vec<Record>,
    /// Last error message.
    pub error: Option<String>,
    /// Pages fetched by the last successful run.
    pub pages_fetched: u64,
    /// Records fetched by the last successful run.
    pub records_fetched: u64,
    /// Queue-level requeues consumed.
    pub retry_count: u32,
    /// Queue-level requeue budget.
    pub max_retries: u32,
    /// Cache query id, once registered.
    pub cache_query_id: Option<String>,
    /// Serve from a completed cache entry instead of refetching.
    pub resume_from_cache: bool,
    /// Enqueue sequence number, for FIFO tie-breaks.
    #[serde(skip)]
    pub(crate) seq: u64,
}

impl Task {
    /// Creates a pending task for `query` against `source`.
    pub fn new(source: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            source: source.into(),
            query: query.into(),
            start_date: None,
            end_date: None,
            limit: None,
            priority: 0,
            config: Map::new(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            records: Vec::new(),
            error: None,
            pages_fetched: 0,
            records_fetched: 0,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            cache_query_id: None,
            resume_from_cache: true,
            seq: 0,
        }
    }

    /// Sets the date range.
    #[must_use]
    pub fn with_dates(mut self, start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> Self {
        self.start_date = start_date;
        self.end_date = end_date;
        self
    }

    /// Sets the result limit.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Sets the priority (lower runs first).
    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the adapter configuration.
    #[must_use]
    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    /// Sets the queue-level requeue budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets whether a completed cache entry may satisfy this task.
    #[must_use]
    pub fn with_resume_from_cache(mut self, resume: bool) -> Self {
        self.resume_from_cache = resume;
        self
    }

    /// Links the task to its cache query.
    #[must_use]
    pub fn with_cache_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.cache_query_id = Some(query_id.into());
        self
    }

    /// Builds the source request for a fresh fetch of this task.
    #[must_use]
    pub fn fetch_request(&self) -> FetchRequest {
        FetchRequest {
            query: self.query.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
            limit: self.limit,
            offset: 0,
            cursor: None,
        }
    }

    /// Position in the pending ordering.
    pub(crate) fn pending_key(&self) -> (i64, u64) {
        (self.priority, self.seq)
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task {{ id: {}, source: {}, query: {}, status: {}, priority: {} }}",
            self.id, self.source, self.query, self.status, self.priority
        )
    }
}
