//! Repository seam for query cache persistence.
//!
//! The orchestrator and worker pool depend on this trait rather than on
//! [`ResumableCache`] directly, so tests can count or fail cache calls.

use async_trait::async_trait;
use chrono::NaiveDate;

use super::{QueryProgress, Result, ResumableCache};
use crate::source::{PageCheckpoint, Record};

/// Data-access contract for resumable query state.
#[async_trait]
pub trait CacheRepository: Send + Sync {
    /// Registers a query (idempotently) and returns its id.
    async fn register_query(
        &self,
        source: &str,
        query: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<String>;

    /// Reads a query's progress.
    async fn get_query_progress(&self, query_id: &str) -> Result<Option<QueryProgress>>;

    /// Stores a page checkpoint.
    async fn cache_page(&self, query_id: &str, page: &PageCheckpoint) -> Result<()>;

    /// Upserts one record.
    async fn cache_record(&self, query_id: &str, record: &Record) -> Result<()>;

    /// Reads cached records in first-cached order.
    async fn get_cached_records(&self, query_id: &str) -> Result<Vec<Record>>;

    /// Sets the completion flag.
    async fn mark_completed(&self, query_id: &str) -> Result<()>;
}

#[async_trait]
impl CacheRepository for ResumableCache {
    async fn register_query(
        &self,
        source: &str,
        query: &str,
        start_date: Option<NaiveDate>,
        end_date: Option<NaiveDate>,
    ) -> Result<String> {
        ResumableCache::register_query(self, source, query, start_date, end_date).await
    }

    async fn get_query_progress(&self, query_id: &str) -> Result<Option<QueryProgress>> {
        ResumableCache::get_query_progress(self, query_id).await
    }

    async fn cache_page(&self, query_id: &str, page: &PageCheckpoint) -> Result<()> {
        ResumableCache::cache_page(self, query_id, page).await
    }

    async fn cache_record(&self, query_id: &str, record: &Record) -> Result<()> {
        ResumableCache::cache_record(self, query_id, record).await
    }

    async fn get_cached_records(&self, query_id: &str) -> Result<Vec<Record>> {
        ResumableCache::get_cached_records(self, query_id).await
    }

    async fn mark_completed(&self, query_id: &str) -> Result<()> {
        ResumableCache::mark_completed(self, query_id).await
    }
}
