//! Drives one fetch: cache lookup, adapter streaming and incremental caching.
//!
//! The orchestrator never retries or classifies. Adapter errors come back
//! unmodified inside [`FetchError::Source`]; the worker pool decides what to
//! do with them.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::cache::{CacheError, CacheRepository};
use crate::queue::Task;
use crate::resilience::{Classify, ErrorKind};
use crate::source::{FetchRequest, Record, RecordSource, SourceError, SourceEvent, SourceRegistry};

/// Records produced by one successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FetchOutcome {
    /// Records in stream (or first-cached) order.
    pub records: Vec<Record>,
    /// True when served entirely from a completed cache entry.
    pub from_cache: bool,
    /// Page checkpoints seen during this fetch.
    pub pages_fetched: u64,
}

/// Errors raised by [`Orchestrator::fetch`].
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The adapter failed (or could not be created).
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Reading or writing the cache failed.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl Classify for FetchError {
    fn error_kind(&self) -> ErrorKind {
        match self {
            Self::Source(error) => error.error_kind(),
            // Lock contention gets the same budget as a flaky connection.
            Self::Cache(error) if error.is_transient() => ErrorKind::Network,
            Self::Cache(_) => ErrorKind::Unknown,
        }
    }
}

/// Result of draining one adapter stream.
struct Drained {
    records: Vec<Record>,
    pages: u64,
    exhausted: bool,
}

/// Maps tasks to adapters and keeps the cache in step with the stream.
pub struct Orchestrator {
    cache: Arc<dyn CacheRepository>,
    sources: SourceRegistry,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("sources", &self.sources)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over `cache` and the adapters in `sources`.
    #[must_use]
    pub fn new(cache: Arc<dyn CacheRepository>, sources: SourceRegistry) -> Self {
        Self { cache, sources }
    }

    /// The cache this orchestrator writes to.
    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CacheRepository> {
        &self.cache
    }

    /// The adapter registry.
    #[must_use]
    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    /// Fetches all records for `task`.
    ///
    /// With `resume` set, a completed cache entry is returned without creating
    /// an adapter, and a partial entry's checkpoint is handed to the adapter as
    /// its starting offset/cursor. Every record is cached as it arrives. The
    /// query is marked completed only when the stream ends on its own, not
    /// when `limit` cuts it short.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::Source`] with the adapter's error unchanged, or
    /// [`FetchError::Cache`] if a cache operation fails.
    #[instrument(skip(self, task), fields(task_id = %task.id, source = %task.source, query_id = tracing::field::Empty))]
    pub async fn fetch(&self, task: &Task, resume: bool) -> Result<FetchOutcome, FetchError> {
        let query_id = self
            .cache
            .register_query(&task.source, &task.query, task.start_date, task.end_date)
            .await?;
        tracing::Span::current().record("query_id", query_id.as_str());

        let progress = self.cache.get_query_progress(&query_id).await?;

        if resume && progress.as_ref().is_some_and(|p| p.completed) {
            let records = self.cached_records(&query_id, task.limit).await?;
            info!(records = records.len(), "served from completed cache entry");
            return Ok(FetchOutcome {
                records,
                from_cache: true,
                pages_fetched: 0,
            });
        }

        let mut request = task.fetch_request();
        let checkpoint = progress.filter(|p| resume && p.has_checkpoint());
        if let Some(progress) = &checkpoint {
            request.offset = progress.last_offset;
            request.cursor.clone_from(&progress.last_cursor);
            debug!(
                offset = request.offset,
                cursor = ?request.cursor,
                "resuming from checkpoint"
            );
        }

        let source = self.sources.create(&task.source, &task.config)?;
        let drained = self.drain(source.as_ref(), request, &query_id).await;
        if let Err(error) = source.close().await {
            warn!(%error, "failed to close source adapter");
        }
        let drained = drained?;

        if drained.exhausted {
            self.cache.mark_completed(&query_id).await?;
        }

        let records = if checkpoint.is_some() {
            self.cached_records(&query_id, task.limit).await?
        } else {
            drained.records
        };

        info!(
            records = records.len(),
            pages = drained.pages,
            complete = drained.exhausted,
            "fetch finished"
        );
        Ok(FetchOutcome {
            records,
            from_cache: false,
            pages_fetched: drained.pages,
        })
    }

    async fn drain(
        &self,
        source: &dyn RecordSource,
        request: FetchRequest,
        query_id: &str,
    ) -> Result<Drained, FetchError> {
        let limit = request.limit;
        let mut stream = source.stream(request);
        let mut drained = Drained {
            records: Vec::new(),
            pages: 0,
            exhausted: false,
        };

        loop {
            if limit.is_some_and(|limit| drained.records.len() >= limit) {
                debug!(limit, "result limit reached, stopping early");
                return Ok(drained);
            }

            match stream.next().await {
                Some(Ok(SourceEvent::Record(record))) => {
                    self.cache.cache_record(query_id, &record).await?;
                    drained.records.push(record);
                }
                Some(Ok(SourceEvent::Page(page))) => {
                    self.cache.cache_page(query_id, &page).await?;
                    drained.pages += 1;
                }
                Some(Err(error)) => return Err(FetchError::Source(error)),
                None => {
                    drained.exhausted = true;
                    return Ok(drained);
                }
            }
        }
    }

    async fn cached_records(
        &self,
        query_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Record>, CacheError> {
        let mut records = self.cache.get_cached_records(query_id).await?;
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures_util::stream;

    use super::*;
    use crate::cache::ResumableCache;
    use crate::db::Database;
    use crate::source::{PageCheckpoint, RateLimiter, RecordStream, SourceContext};

    /// Serves `total` records in pages of two, honoring the request offset.
    struct Paged {
        total: u64,
        fail_at: Option<u64>,
        calls: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl RecordSource for Paged {
        fn name(&self) -> &str {
            "paged"
        }

        fn stream(&self, request: FetchRequest) -> RecordStream<'_> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut events = Vec::new();
            for i in request.offset..self.total {
                if self.fail_at == Some(i) {
                    events.push(Err(SourceError::network("paged", "connection reset")));
                    break;
                }
                events.push(Ok(SourceEvent::Record(Record::new(i.to_string(), "t"))));
                if i % 2 == 1 {
                    events.push(Ok(SourceEvent::Page(PageCheckpoint {
                        page_number: i / 2 + 1,
                        raw_response: None,
                        offset: Some(i + 1),
                        cursor: None,
                    })));
                }
            }
            stream::iter(events).boxed()
        }

        async fn close(&self) -> Result<(), SourceError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        cache: ResumableCache,
        calls: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    async fn fixture(total: u64, fail_at: Option<u64>) -> Fixture {
        let cache = ResumableCache::new(Database::new_in_memory().await.unwrap());
        let calls = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));

        let mut sources = SourceRegistry::new(Arc::new(RateLimiter::disabled()));
        let (c, d) = (Arc::clone(&calls), Arc::clone(&closes));
        sources.register("paged", move |_ctx: &SourceContext| {
            Ok(Box::new(Paged {
                total,
                fail_at,
                calls: Arc::clone(&c),
                closes: Arc::clone(&d),
            }))
        });

        Fixture {
            orchestrator: Orchestrator::new(Arc::new(cache.clone()), sources),
            cache,
            calls,
            closes,
        }
    }

    #[tokio::test]
    async fn test_fetch_streams_caches_and_marks_complete() {
        let fx = fixture(5, None).await;
        let task = Task::new("paged", "q");

        let outcome = fx.orchestrator.fetch(&task, true).await.unwrap();
        assert_eq!(outcome.records.len(), 5);
        assert!(!outcome.from_cache);
        assert_eq!(outcome.pages_fetched, 2);
        assert_eq!(fx.closes.load(Ordering::SeqCst), 1);

        let id = crate::cache::query_id("paged", "q", None, None);
        let progress = fx.cache.get_query_progress(&id).await.unwrap().unwrap();
        assert!(progress.completed);
        assert_eq!(progress.total_records, 5);
    }

    #[tokio::test]
    async fn test_fetch_completed_query_skips_source() {
        let fx = fixture(3, None).await;
        let task = Task::new("paged", "q");
        fx.orchestrator.fetch(&task, true).await.unwrap();

        let outcome = fx.orchestrator.fetch(&task, true).await.unwrap();
        assert!(outcome.from_cache);
        assert_eq!(outcome.records.len(), 3);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_fetch_without_resume_refetches() {
        let fx = fixture(3, None).await;
        let task = Task::new("paged", "q");
        fx.orchestrator.fetch(&task, true).await.unwrap();
        let outcome = fx.orchestrator.fetch(&task, false).await.unwrap();

        assert!(!outcome.from_cache);
        assert_eq!(fx.calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.records.len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_limit_stops_early_without_completing() {
        let fx = fixture(10, None).await;
        let task = Task::new("paged", "q").with_limit(3);

        let outcome = fx.orchestrator.fetch(&task, true).await.unwrap();
        assert_eq!(outcome.records.len(), 3);

        let id = crate::cache::query_id("paged", "q", None, None);
        let progress = fx.cache.get_query_progress(&id).await.unwrap().unwrap();
        assert!(!progress.completed);
    }

    #[tokio::test]
    async fn test_fetch_error_propagates_unmodified_and_keeps_partial_records() {
        let fx = fixture(6, Some(3)).await;
        let task = Task::new("paged", "q");

        let err = fx.orchestrator.fetch(&task, true).await.unwrap_err();
        let FetchError::Source(source_err) = &err else {
            panic!("expected source error, got {err:?}");
        };
        assert!(matches!(source_err, SourceError::Network { .. }));
        assert_eq!(err.error_kind(), ErrorKind::Network);
        assert_eq!(fx.closes.load(Ordering::SeqCst), 1);

        let id = crate::cache::query_id("paged", "q", None, None);
        assert_eq!(fx.cache.count_cached_records(&id).await.unwrap(), 3);
        let progress = fx.cache.get_query_progress(&id).await.unwrap().unwrap();
        assert_eq!(progress.last_offset, 2);
    }

    #[tokio::test]
    async fn test_fetch_resumes_from_checkpoint() {
        let fx = fixture(6, Some(3)).await;
        let task = Task::new("paged", "q");
        fx.orchestrator.fetch(&task, true).await.unwrap_err();

        // Same query, healthy source this time.
        let healthy = fixture(6, None).await;
        let orchestrator = Orchestrator::new(
            Arc::new(fx.cache.clone()),
            healthy.orchestrator.sources.clone(),
        );
        let outcome = orchestrator.fetch(&task, true).await.unwrap();

        let ids: Vec<_> = outcome.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4", "5"]);
        assert_eq!(outcome.pages_fetched, 2);
    }

    #[tokio::test]
    async fn test_fetch_unknown_source_is_validation_error() {
        let fx = fixture(1, None).await;
        let err = fx
            .orchestrator
            .fetch(&Task::new("missing", "q"), true)
            .await
            .unwrap_err();
        assert_eq!(err.error_kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_cache_contention_classifies_as_network() {
        let busy = FetchError::from(CacheError::from(sqlx::Error::PoolTimedOut));
        assert_eq!(busy.error_kind(), ErrorKind::Network);

        let closed = FetchError::from(CacheError::from(sqlx::Error::PoolClosed));
        assert_eq!(closed.error_kind(), ErrorKind::Unknown);

        let unknown = FetchError::from(CacheError::UnknownQuery("q".to_string()));
        assert_eq!(unknown.error_kind(), ErrorKind::Unknown);
    }
}
