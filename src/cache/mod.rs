//! Resumable per-query cache backed by `SQLite`.
//!
//! Each distinct (source, query, date range) is registered once under a
//! deterministic [`query_id`]. Records are upserted as they stream in, so a
//! crash mid-fetch keeps everything written so far, and page checkpoints keep
//! the offset/cursor to resume from. Once the source stream is drained the
//! query is marked completed and later fetches are served from here.
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::cache::ResumableCache;
//! use harvester_core::source::Record;
//! use harvester_core::Database;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = ResumableCache::new(Database::new_in_memory().await?);
//! let id = cache.register_query("arxiv", "graph learning", None, None).await?;
//! cache.cache_record(&id, &Record::new("2101.00001", "A paper")).await?;
//! cache.mark_completed(&id).await?;
//! assert_eq!(cache.get_cached_records(&id).await?.len(), 1);
//! # Ok(())
//! # }
//! ```

mod error;
mod progress;
mod repository;

pub use error::CacheError;
pub use progress::{QueryProgress, query_id};
pub use repository::CacheRepository;

use chrono::{NaiveDate, Utc};
use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;
use crate::source::{PageCheckpoint, Record};
use progress::{QueryRow, format_date};

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Durable query progress and record store.
#[derive(Debug, Clone)]
pub struct ResumableCache {
    db: Database,
}

impl ResumableCache {
    /// Creates a cache over an already-migrated database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Registers a query and returns its id.
    ///
    /// Idempotent: re-registering a known combination returns the same id and
    /// leaves its progress untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the insert fails.
    #[instrument(skip(self), fields(query_id = tracing::field::Empty))]
    pub async fn register_query(
        &self,
        source: &str,
        query: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<String> {
        let id = query_id(source, query, start_date, end_date);
        tracing::Span::current().record("query_id", id.as_str());

        let result = sqlx::query(
            r"INSERT INTO queries (query_id, source, query_text, start_date, end_date, created_at)
              VALUES (?, ?, ?, ?, ?, ?)
              ON CONFLICT(query_id) DO NOTHING",
        )
        .bind(&id)
        .bind(source)
        .bind(query)
        .bind(start_date.map(|d| format_date(Some(d))))
        .bind(end_date.map(|d| format_date(Some(d))))
        .bind(Utc::now().to_rfc3339())
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() > 0 {
            debug!("registered new query");
        }
        Ok(id)
    }

    /// Returns the progress of `query_id`, if registered.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails, or
    /// [`CacheError::Corrupt`] if the stored row cannot be decoded.
    #[instrument(skip(self))]
    pub async fn get_query_progress(&self, query_id: &str) -> Result<Option<QueryProgress>> {
        let row = sqlx::query_as::<_, QueryRow>(r"SELECT * FROM queries WHERE query_id = ?")
            .bind(query_id)
            .fetch_optional(self.db.pool())
            .await?;

        row.map(QueryProgress::try_from).transpose()
    }

    /// Stores a page checkpoint and advances the query's resume point.
    ///
    /// Re-caching a page number overwrites it. `offset`/`cursor` left `None`
    /// keep the previous resume point.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownQuery`] if `query_id` was never registered,
    /// or [`CacheError::Database`] if a write fails.
    #[instrument(skip(self, page), fields(page = page.page_number))]
    pub async fn cache_page(&self, query_id: &str, page: &PageCheckpoint) -> Result<()> {
        let raw = page
            .raw_response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let page_number = to_i64(page.page_number);
        let offset = page.offset.map(to_i64);

        let mut tx = self.db.pool().begin().await?;

        let inserted = sqlx::query(
            r"INSERT INTO cached_pages (query_id, page_number, raw_response, page_offset, page_cursor, cached_at)
              SELECT ?, ?, ?, ?, ?, ?
              WHERE EXISTS (SELECT 1 FROM queries WHERE query_id = ?)
              ON CONFLICT(query_id, page_number) DO UPDATE SET
                  raw_response = excluded.raw_response,
                  page_offset = excluded.page_offset,
                  page_cursor = excluded.page_cursor,
                  cached_at = excluded.cached_at",
        )
        .bind(query_id)
        .bind(page_number)
        .bind(raw)
        .bind(offset)
        .bind(page.cursor.as_deref())
        .bind(Utc::now().to_rfc3339())
        .bind(query_id)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(CacheError::UnknownQuery(query_id.to_string()));
        }

        sqlx::query(
            r"UPDATE queries SET
                  total_pages = (SELECT COUNT(*) FROM cached_pages WHERE query_id = ?),
                  last_offset = COALESCE(?, last_offset),
                  last_cursor = COALESCE(?, last_cursor)
              WHERE query_id = ?",
        )
        .bind(query_id)
        .bind(offset)
        .bind(page.cursor.as_deref())
        .bind(query_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!("page checkpoint cached");
        Ok(())
    }

    /// Upserts a record keyed by `(query_id, record.id)`.
    ///
    /// Re-caching overwrites the payload and keeps the record's original
    /// position in [`get_cached_records`](Self::get_cached_records) order.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownQuery`] if `query_id` was never registered,
    /// [`CacheError::Serialization`] if the record cannot be encoded, or
    /// [`CacheError::Database`] if a write fails.
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn cache_record(&self, query_id: &str, record: &Record) -> Result<()> {
        let payload = serde_json::to_string(record)?;

        let mut tx = self.db.pool().begin().await?;

        let inserted = sqlx::query(
            r"INSERT INTO cached_records (query_id, record_id, payload, cached_at)
              SELECT ?, ?, ?, ?
              WHERE EXISTS (SELECT 1 FROM queries WHERE query_id = ?)
              ON CONFLICT(query_id, record_id) DO UPDATE SET
                  payload = excluded.payload,
                  cached_at = excluded.cached_at",
        )
        .bind(query_id)
        .bind(&record.id)
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .bind(query_id)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(CacheError::UnknownQuery(query_id.to_string()));
        }

        sqlx::query(
            r"UPDATE queries
              SET total_records = (SELECT COUNT(*) FROM cached_records WHERE query_id = ?)
              WHERE query_id = ?",
        )
        .bind(query_id)
        .bind(query_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Returns the cached records of `query_id` in first-cached order.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails, or
    /// [`CacheError::Serialization`] if a payload cannot be decoded.
    #[instrument(skip(self))]
    pub async fn get_cached_records(&self, query_id: &str) -> Result<Vec<Record>> {
        let rows = sqlx::query(
            r"SELECT payload FROM cached_records WHERE query_id = ? ORDER BY row_id ASC",
        )
        .bind(query_id)
        .fetch_all(self.db.pool())
        .await?;

        let records = rows
            .iter()
            .map(|row| -> Result<Record> {
                let payload: String = row.try_get("payload")?;
                Ok(serde_json::from_str::<Record>(&payload)?)
            })
            .collect::<Result<Vec<_>>>()?;

        debug!(count = records.len(), "loaded cached records");
        Ok(records)
    }

    /// Marks `query_id` as fully fetched.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::UnknownQuery`] if `query_id` was never registered,
    /// or [`CacheError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn mark_completed(&self, query_id: &str) -> Result<()> {
        let result = sqlx::query(r"UPDATE queries SET completed = 1 WHERE query_id = ?")
            .bind(query_id)
            .execute(self.db.pool())
            .await?;

        if result.rows_affected() == 0 {
            return Err(CacheError::UnknownQuery(query_id.to_string()));
        }
        debug!("query marked completed");
        Ok(())
    }

    /// Number of records cached for `query_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_cached_records(&self, query_id: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar(r"SELECT COUNT(*) FROM cached_records WHERE query_id = ?")
                .bind(query_id)
                .fetch_one(self.db.pool())
                .await?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Removes a query with its records and pages.
    ///
    /// Returns `true` if the query existed.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::Database`] if a delete fails.
    #[instrument(skip(self))]
    pub async fn clear_query(&self, query_id: &str) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query(r"DELETE FROM cached_records WHERE query_id = ?")
            .bind(query_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(r"DELETE FROM cached_pages WHERE query_id = ?")
            .bind(query_id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query(r"DELETE FROM queries WHERE query_id = ?")
            .bind(query_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        let existed = result.rows_affected() > 0;
        debug!(existed, "query cleared");
        Ok(existed)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
