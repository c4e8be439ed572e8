//! High-level facade over the queue, cache and worker pool.
//!
//! [`FetchManager`] owns one database shared by the task queue and the
//! resumable cache, builds the orchestrator and breaker registry, and runs
//! the worker pool on demand.
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::config::HarvestConfig;
//! use harvester_core::manager::{FetchManager, SearchRequest};
//!
//! # async fn example() -> Result<(), harvester_core::manager::ManagerError> {
//! let config = HarvestConfig::default();
//! let registry = FetchManager::registry_for(&config);
//! // registry.register("crossref", ...);
//!
//! let manager = FetchManager::new(config, registry).await?;
//! let id = manager
//!     .add_search(SearchRequest::new("crossref", "graph neural networks").with_limit(100))
//!     .await?;
//! manager.run().await?;
//! let records = manager.get_results(&id).await.unwrap_or_default();
//! println!("{} records", records.len());
//! manager.close().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, instrument};

use crate::cache::{CacheError, ResumableCache};
use crate::config::{ConfigError, HarvestConfig};
use crate::db::{Database, DbError};
use crate::orchestrator::Orchestrator;
use crate::queue::{QueueError, Task, TaskId, TaskQueue, TaskStatus};
use crate::resilience::BreakerRegistry;
use crate::source::{RateLimiter, Record, SourceRegistry};
use crate::worker::{PoolError, StatsSnapshot, WorkerPool};

/// Errors surfaced by [`FetchManager`].
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The database could not be opened.
    #[error(transparent)]
    Database(#[from] DbError),

    /// A queue operation failed.
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// A cache operation failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Starting or stopping the worker pool failed.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Parameters of one search to schedule.
///
/// # Example
///
/// ```
/// use harvester_core::SearchRequest;
///
/// let request = SearchRequest::new("openalex", "graphene")
///     .with_limit(50)
///     .with_priority(-1)
///     .with_resume_from_cache(false);
///
/// assert_eq!(request.limit, Some(50));
/// assert_eq!(request.priority, -1);
/// assert!(!request.resume_from_cache);
/// assert_eq!(request.max_retries, None);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// Name of a source registered with the [`SourceRegistry`].
    pub source: String,
    /// Query text passed to the adapter.
    pub query: String,
    /// Inclusive lower date bound.
    pub start_date: Option<NaiveDate>,
    /// Inclusive upper date bound.
    pub end_date: Option<NaiveDate>,
    /// Stop after this many records. A limited fetch is never marked complete
    /// in the cache.
    pub limit: Option<usize>,
    /// Lower runs first.
    pub priority: i64,
    /// Adapter-specific settings, handed to the source factory.
    pub config: Map<String, Value>,
    /// Requeue budget; falls back to the queue's `default_max_retries`.
    pub max_retries: Option<u32>,
    /// Serve completed queries from the cache and resume partial ones from
    /// their last checkpoint. Defaults to true.
    pub resume_from_cache: bool,
}

impl SearchRequest {
    /// Creates a request with priority 0, no bounds and cache resume enabled.
    #[must_use]
    pub fn new(source: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            query: query.into(),
            start_date: None,
            end_date: None,
            limit: None,
            priority: 0,
            config: Map::new(),
            max_retries: None,
            resume_from_cache: true,
        }
    }

    /// Sets both date bounds; `None` leaves that side open.
    #[must_use]
    pub fn with_dates(mut self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        self.start_date = start;
        self.end_date = end;
        self
    }

    /// Caps the number of records returned.
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

    /// Replaces the adapter configuration.
    #[must_use]
    pub fn with_config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    /// Overrides the queue-level requeue budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Disabling this forces a fresh fetch from the first page.
    #[must_use]
    pub fn with_resume_from_cache(mut self, resume: bool) -> Self {
        self.resume_from_cache = resume;
        self
    }
}

/// Schedules searches and runs them to completion.
#[derive(Debug)]
pub struct FetchManager {
    config: HarvestConfig,
    db: Database,
    queue: Arc<TaskQueue>,
    cache: Arc<ResumableCache>,
    pool: WorkerPool,
}

impl FetchManager {
    /// Creates an empty registry whose rate limiter follows `config.rate_limit`.
    #[must_use]
    pub fn registry_for(config: &HarvestConfig) -> SourceRegistry {
        SourceRegistry::new(Arc::new(RateLimiter::from_config(&config.rate_limit)))
    }

    /// Validates `config`, opens the database and wires every component.
    ///
    /// Tasks left PENDING or RUNNING by a previous process on the same
    /// database file are picked up again.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Config`] for invalid settings,
    /// [`ManagerError::Database`] if the database can't be opened, or
    /// [`ManagerError::Queue`] if stored tasks can't be loaded.
    #[instrument(skip_all, fields(sources = ?sources.names()))]
    pub async fn new(config: HarvestConfig, sources: SourceRegistry) -> Result<Self, ManagerError> {
        config.validate()?;

        let db = match &config.database_path {
            Some(path) => Database::new_with_options(path, &config.database).await?,
            None => Database::new_in_memory().await?,
        };

        let queue = Arc::new(TaskQueue::open(db.clone(), &config.queue).await?);
        let cache = Arc::new(ResumableCache::new(db.clone()));
        let orchestrator = Arc::new(Orchestrator::new(cache.clone(), sources));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let pool = WorkerPool::new(Arc::clone(&queue), orchestrator, breakers, &config);

        info!(
            persistent = config.database_path.is_some(),
            num_workers = config.worker.num_workers,
            "fetch manager ready"
        );

        Ok(Self {
            config,
            db,
            queue,
            cache,
            pool,
        })
    }

    /// Runs `f` against a fresh manager and closes it afterwards.
    ///
    /// # Errors
    ///
    /// Returns any error from [`FetchManager::new`] or [`FetchManager::close`].
    pub async fn scoped<F, Fut, T>(
        config: HarvestConfig,
        sources: SourceRegistry,
        f: F,
    ) -> Result<T, ManagerError>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: Future<Output = T>,
    {
        let manager = Arc::new(Self::new(config, sources).await?);
        let output = f(Arc::clone(&manager)).await;
        manager.close().await?;
        Ok(output)
    }

    /// The task queue.
    #[must_use]
    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    /// The resumable cache.
    #[must_use]
    pub fn cache(&self) -> &Arc<ResumableCache> {
        &self.cache
    }

    /// Schedules one search and returns its task id.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Cache`] if the query can't be registered, or
    /// [`ManagerError::Queue`] if the queue rejects the task.
    #[instrument(skip(self, request), fields(source = %request.source, query = %request.query))]
    pub async fn add_search(&self, request: SearchRequest) -> Result<TaskId, ManagerError> {
        let query_id = self
            .cache
            .register_query(
                &request.source,
                &request.query,
                request.start_date,
                request.end_date,
            )
            .await?;

        let mut task = Task::new(request.source, request.query)
            .with_dates(request.start_date, request.end_date)
            .with_priority(request.priority)
            .with_config(request.config)
            .with_max_retries(
                request
                    .max_retries
                    .unwrap_or(self.config.queue.default_max_retries),
            )
            .with_resume_from_cache(request.resume_from_cache)
            .with_cache_query_id(query_id);
        if let Some(limit) = request.limit {
            task = task.with_limit(limit);
        }

        Ok(self.queue.enqueue(task).await?)
    }

    /// Schedules several searches, stopping at the first failure.
    ///
    /// # Errors
    ///
    /// Same as [`FetchManager::add_search`]; searches before the failing one
    /// stay scheduled.
    pub async fn add_searches(
        &self,
        requests: impl IntoIterator<Item = SearchRequest>,
    ) -> Result<Vec<TaskId>, ManagerError> {
        let mut ids = Vec::new();
        for request in requests {
            ids.push(self.add_search(request).await?);
        }
        Ok(ids)
    }

    /// Runs the worker pool until every scheduled task is finished.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Pool`] if the pool is already running or its
    /// shutdown fails.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<StatsSnapshot, ManagerError> {
        self.pool.start().await?;
        self.pool.wait_until_complete().await;
        self.pool.stop(self.config.worker.shutdown_timeout()).await?;

        let stats = self.pool.stats().snapshot();
        info!(
            completed = stats.completed,
            cached = stats.cached,
            failed = stats.failed,
            "all scheduled searches finished"
        );
        Ok(stats)
    }

    /// Records of a COMPLETED or CACHED task.
    pub async fn get_results(&self, id: &TaskId) -> Option<Vec<Record>> {
        self.queue
            .get_task(id)
            .await
            .filter(|task| task.status.has_results())
            .map(|task| task.records)
    }

    /// Records of every COMPLETED or CACHED task, keyed by task id.
    pub async fn get_all_results(&self) -> HashMap<TaskId, Vec<Record>> {
        self.queue
            .get_all_tasks()
            .await
            .into_iter()
            .filter(|task| task.status.has_results())
            .map(|task| (task.id, task.records))
            .collect()
    }

    /// Current status of a task, or `None` if the id is unknown.
    pub async fn get_status(&self, id: &TaskId) -> Option<TaskStatus> {
        self.queue.get_task(id).await.map(|task| task.status)
    }

    /// Snapshot of a task including its records and last error.
    pub async fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.queue.get_task(id).await
    }

    /// Cancels a task. Returns false if it is unknown or already finished.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Queue`] if the change can't be persisted.
    pub async fn cancel(&self, id: &TaskId) -> Result<bool, ManagerError> {
        Ok(self.queue.cancel_task(id).await?)
    }

    /// Number of PENDING tasks.
    pub async fn pending_count(&self) -> usize {
        self.queue.size().await
    }

    /// Worker counters accumulated since the manager was created.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.pool.stats().snapshot()
    }

    /// Stops the pool if it is running and closes the database.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Pool`] if requeueing aborted tasks fails.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), ManagerError> {
        self.pool.stop(self.config.worker.shutdown_timeout()).await?;
        self.db.close().await;
        info!("fetch manager closed");
        Ok(())
    }
}
