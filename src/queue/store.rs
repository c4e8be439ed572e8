//! `SQLite` persistence for tasks.
//!
//! Every queue mutation writes the full task row through [`upsert_task`]
//! before it becomes visible in memory.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::FromRow;
use sqlx::sqlite::SqlitePool;

use super::{QueueError, Result, Task, TaskId, TaskStatus};
use crate::source::Record;

/// Raw `tasks` row.
#[derive(Debug, FromRow)]
pub(crate) struct TaskRow {
    pub id: String,
    pub seq: i64,
    pub source: String,
    pub query: String,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub result_limit: Option<i64>,
    pub priority: i64,
    pub config: String,
    pub status: String,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub records: String,
    pub last_error: Option<String>,
    pub pages_fetched: i64,
    pub records_fetched: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub cache_query_id: Option<String>,
    pub resume_from_cache: bool,
}

impl TryFrom<TaskRow> for Task {
    type Error = QueueError;

    fn try_from(row: TaskRow) -> Result<Self> {
        let id = row.id.clone();
        let bad = |message: String| QueueError::serialization(&id, message);

        let task_id: TaskId = row.id.parse().map_err(|e| bad(format!("bad id: {e}")))?;
        let status: TaskStatus = row
            .status
            .parse()
            .map_err(|_| QueueError::invalid_status(&row.status))?;
        let config = serde_json::from_str(&row.config).map_err(|e| bad(e.to_string()))?;
        let records: Vec<Record> =
            serde_json::from_str(&row.records).map_err(|e| bad(e.to_string()))?;

        Ok(Self {
            id: task_id,
            source: row.source,
            query: row.query,
            start_date: parse_date(row.start_date.as_deref()).map_err(&bad)?,
            end_date: parse_date(row.end_date.as_deref()).map_err(&bad)?,
            limit: row
                .result_limit
                .map(usize::try_from)
                .transpose()
                .map_err(|e| bad(format!("bad result_limit: {e}")))?,
            priority: row.priority,
            config,
            status,
            created_at: parse_timestamp(&row.created_at).map_err(&bad)?,
            started_at: row
                .started_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(&bad)?,
            completed_at: row
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()
                .map_err(&bad)?,
            records,
            error: row.last_error,
            pages_fetched: u64::try_from(row.pages_fetched).unwrap_or_default(),
            records_fetched: u64::try_from(row.records_fetched).unwrap_or_default(),
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            max_retries: u32::try_from(row.max_retries).unwrap_or_default(),
            cache_query_id: row.cache_query_id,
            resume_from_cache: row.resume_from_cache,
            seq: u64::try_from(row.seq).unwrap_or_default(),
        })
    }
}

fn parse_date(value: Option<&str>) -> std::result::Result<Option<NaiveDate>, String> {
    value
        .map(|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").map_err(|e| format!("bad date '{v}': {e}")))
        .transpose()
}

fn parse_timestamp(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{value}': {e}"))
}

fn to_i64<T: TryInto<i64>>(value: T) -> i64 {
    value.try_into().unwrap_or(i64::MAX)
}

/// Inserts or fully overwrites the row for `task`.
pub(crate) async fn upsert_task(pool: &SqlitePool, task: &Task) -> Result<()> {
    let config = serde_json::to_string(&task.config)
        .map_err(|e| QueueError::serialization(&task.id, e))?;
    let records = serde_json::to_string(&task.records)
        .map_err(|e| QueueError::serialization(&task.id, e))?;

    sqlx::query(
        r"INSERT INTO tasks (
              id, seq, source, query, start_date, end_date, result_limit, priority,
              config, status, created_at, started_at, completed_at, records,
              last_error, pages_fetched, records_fetched, retry_count, max_retries,
              cache_query_id, resume_from_cache
          )
          VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
          ON CONFLICT(id) DO UPDATE SET
              seq = excluded.seq,
              priority = excluded.priority,
              config = excluded.config,
              status = excluded.status,
              started_at = excluded.started_at,
              completed_at = excluded.completed_at,
              records = excluded.records,
              last_error = excluded.last_error,
              pages_fetched = excluded.pages_fetched,
              records_fetched = excluded.records_fetched,
              retry_count = excluded.retry_count,
              max_retries = excluded.max_retries,
              cache_query_id = excluded.cache_query_id,
              resume_from_cache = excluded.resume_from_cache",
    )
    .bind(task.id.to_string())
    .bind(to_i64(task.seq))
    .bind(&task.source)
    .bind(&task.query)
    .bind(task.start_date.map(|d| d.format("%Y-%m-%d").to_string()))
    .bind(task.end_date.map(|d| d.format("%Y-%m-%d").to_string()))
    .bind(task.limit.map(to_i64))
    .bind(task.priority)
    .bind(config)
    .bind(task.status.as_str())
    .bind(task.created_at.to_rfc3339())
    .bind(task.started_at.map(|t| t.to_rfc3339()))
    .bind(task.completed_at.map(|t| t.to_rfc3339()))
    .bind(records)
    .bind(task.error.as_deref())
    .bind(to_i64(task.pages_fetched))
    .bind(to_i64(task.records_fetched))
    .bind(i64::from(task.retry_count))
    .bind(i64::from(task.max_retries))
    .bind(task.cache_query_id.as_deref())
    .bind(task.resume_from_cache)
    .execute(pool)
    .await?;

    Ok(())
}

/// Loads every stored task in enqueue order.
pub(crate) async fn load_tasks(pool: &SqlitePool) -> Result<Vec<Task>> {
    let rows = sqlx::query_as::<_, TaskRow>(r"SELECT * FROM tasks ORDER BY seq ASC")
        .fetch_all(pool)
        .await?;

    rows.into_iter().map(Task::try_from).collect()
}
