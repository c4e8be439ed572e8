//! Worker pool: concurrent task execution with retry, backoff and breakers.
//!
//! Each worker loops: dequeue with a short timeout (so it notices a stop
//! signal), execute the task, report the outcome to the queue. Execution of
//! one task:
//!
//! 1. If the task may resume and its cache entry is complete, finish it as
//!    CACHED without touching the source.
//! 2. Otherwise run up to `max_attempts` attempts through the source's
//!    circuit breaker. Failures are classified; retryable ones sleep a
//!    kind-specific backoff (stretched to any server `Retry-After`), the
//!    rest go to [`TaskQueue::fail_task`], which applies the task-level
//!    requeue budget.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use harvester_core::config::HarvestConfig;
//! use harvester_core::worker::WorkerPool;
//! # use harvester_core::{orchestrator::Orchestrator, queue::TaskQueue, resilience::BreakerRegistry};
//!
//! # async fn example(queue: Arc<TaskQueue>, orchestrator: Arc<Orchestrator>) -> Result<(), Box<dyn std::error::Error>> {
//! let config = HarvestConfig::default();
//! let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
//! let pool = WorkerPool::new(queue, orchestrator, breakers, &config);
//!
//! pool.start().await?;
//! pool.wait_until_complete().await;
//! pool.stop(Duration::from_secs(30)).await?;
//! println!("completed: {}", pool.stats().completed());
//! # Ok(())
//! # }
//! ```

mod stats;

pub use stats::{StatsSnapshot, WorkerStats};

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{HarvestConfig, WorkerConfig};
use crate::orchestrator::{FetchError, FetchOutcome, Orchestrator};
use crate::queue::{QueueError, Task, TaskQueue, TaskStatus};
use crate::resilience::{BreakerError, BreakerRegistry, Classify, RetryDecision, RetryPolicy};
use crate::source::RateLimiter;

/// Tries per outcome write before the task is released in memory.
const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Errors from worker pool lifecycle operations.
#[derive(Debug, Error)]
pub enum PoolError {
    /// `start` was called on a pool that is already running.
    #[error("worker pool is already running\n  Suggestion: Call stop() before starting it again")]
    AlreadyRunning,

    /// Resetting interrupted tasks after a forced stop failed.
    #[error("failed to requeue interrupted tasks: {0}")]
    Queue(#[from] QueueError),
}

/// Handles of a started pool.
struct Running {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

/// Everything a worker needs, shared by all workers of a pool.
struct WorkerContext {
    queue: Arc<TaskQueue>,
    orchestrator: Arc<Orchestrator>,
    breakers: Arc<BreakerRegistry>,
    policy: RetryPolicy,
    poll_interval: Duration,
    stats: Arc<WorkerStats>,
}

/// Fixed-size pool of workers sharing one queue and one orchestrator.
pub struct WorkerPool {
    ctx: Arc<WorkerContext>,
    config: WorkerConfig,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("stats", &self.ctx.stats.snapshot())
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Creates a stopped pool.
    #[must_use]
    pub fn new(
        queue: Arc<TaskQueue>,
        orchestrator: Arc<Orchestrator>,
        breakers: Arc<BreakerRegistry>,
        config: &HarvestConfig,
    ) -> Self {
        let ctx = WorkerContext {
            queue,
            orchestrator,
            breakers,
            policy: RetryPolicy::from_config(config.worker.max_attempts, &config.backoff),
            poll_interval: config.worker.poll_interval(),
            stats: Arc::new(WorkerStats::new()),
        };
        Self {
            ctx: Arc::new(ctx),
            config: config.worker.clone(),
            running: Mutex::new(None),
        }
    }

    /// Shared activity counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<WorkerStats> {
        &self.ctx.stats
    }

    /// Returns true between `start` and `stop`.
    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Spawns `num_workers` workers.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::AlreadyRunning`] if the pool was already started.
    #[instrument(skip(self), fields(num_workers = self.config.num_workers))]
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(PoolError::AlreadyRunning);
        }

        let (shutdown, receiver) = watch::channel(false);
        let handles = (0..self.config.num_workers.max(1))
            .map(|worker_id| {
                let ctx = Arc::clone(&self.ctx);
                let receiver = receiver.clone();
                tokio::spawn(async move { ctx.run(worker_id, receiver).await })
            })
            .collect();

        *running = Some(Running { shutdown, handles });
        info!("worker pool started");
        Ok(())
    }

    /// Signals all workers to stop and waits up to `timeout` for them.
    ///
    /// Workers still busy at the deadline are aborted and their tasks reset
    /// to PENDING. Returns how many workers were aborted. Stopping a pool
    /// that isn't running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`PoolError::Queue`] if resetting aborted tasks fails.
    #[instrument(skip(self))]
    pub async fn stop(&self, timeout: Duration) -> Result<usize, PoolError> {
        let Some(Running { shutdown, handles }) = self.running.lock().await.take() else {
            return Ok(0);
        };

        // Receivers may already be gone if every worker exited.
        let _ = shutdown.send(true);
        let deadline = Instant::now() + timeout;
        let mut aborted = 0;

        for mut handle in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
                // Wait for the abort to land before touching its task.
                let _ = handle.await;
                aborted += 1;
            }
        }

        if aborted > 0 {
            warn!(aborted, "workers did not stop in time and were aborted");
            let reset = self.ctx.queue.reset_running().await?;
            info!(reset, "requeued tasks of aborted workers");
        }
        info!("worker pool stopped");
        Ok(aborted)
    }

    /// Waits until nothing is pending or running.
    pub async fn wait_until_complete(&self) {
        let poll = self.config.completion_poll();
        while !self.ctx.queue.is_idle().await {
            tokio::time::sleep(poll).await;
        }
    }

    /// Executes one claimed task in the calling task, as a worker would.
    pub async fn execute_task(&self, task: Task) {
        self.ctx.execute(0, task).await;
    }
}

impl WorkerContext {
    async fn run(&self, worker_id: usize, shutdown: watch::Receiver<bool>) {
        debug!(worker_id, "worker started");

        while !*shutdown.borrow() {
            match self.queue.dequeue(self.poll_interval).await {
                Ok(Some(task)) => self.execute(worker_id, task).await,
                Ok(None) => {}
                Err(e) => {
                    error!(worker_id, error = %e, "failed to dequeue task");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }

        debug!(worker_id, "worker stopped");
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, source = %task.source))]
    async fn execute(&self, worker_id: usize, task: Task) {
        if task.resume_from_cache {
            if let Some(outcome) = self.completed_cache_entry(&task).await {
                self.complete(&task, outcome).await;
                return;
            }
        }

        let max_attempts = self.policy.max_attempts();
        let breaker = self.breakers.get(&task.source);

        for attempt in 1..=max_attempts {
            if self.queue.is_cancelled(&task.id).await {
                info!(worker_id, attempt, "task cancelled, abandoning");
                self.stats.increment_cancelled();
                return;
            }

            debug!(worker_id, attempt, max_attempts, "attempting fetch");
            let result = breaker
                .call(|| self.orchestrator.fetch(&task, task.resume_from_cache))
                .await;

            let error = match result {
                Ok(outcome) => {
                    self.complete(&task, outcome).await;
                    return;
                }
                Err(error) => error,
            };

            if error.is_open() {
                self.stats.increment_circuit_rejections();
            }
            let kind = error.error_kind();

            match self.policy.should_retry(kind, attempt) {
                RetryDecision::Retry { delay, .. } => {
                    let delay = self.stretch_to_retry_after(&task.source, &error, delay).await;
                    self.stats.increment_retried();
                    warn!(
                        worker_id,
                        attempt,
                        %kind,
                        error = %error,
                        delay_ms = delay.as_millis(),
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::DoNotRetry { reason } => {
                    let message = format!(
                        "{kind}: {error} (attempt {attempt}/{max_attempts}, {reason})"
                    );
                    self.fail(&task, &message).await;
                    return;
                }
            }
        }
    }

    /// Returns the cached outcome if the task's query is already complete.
    async fn completed_cache_entry(&self, task: &Task) -> Option<FetchOutcome> {
        let query_id = task.cache_query_id.as_deref()?;
        let cache = self.orchestrator.cache();

        let lookup = async {
            let progress = cache.get_query_progress(query_id).await?;
            if !progress.is_some_and(|p| p.completed) {
                return Ok(None);
            }
            let mut records = cache.get_cached_records(query_id).await?;
            if let Some(limit) = task.limit {
                records.truncate(limit);
            }
            Ok::<_, crate::cache::CacheError>(Some(records))
        };

        match lookup.await {
            Ok(Some(records)) => {
                debug!(records = records.len(), "serving task from cache");
                Some(FetchOutcome {
                    records,
                    from_cache: true,
                    pages_fetched: 0,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "cache lookup failed, fetching from source");
                None
            }
        }
    }

    /// Applies a server-mandated delay on top of the computed backoff.
    async fn stretch_to_retry_after(
        &self,
        source: &str,
        error: &BreakerError<FetchError>,
        delay: Duration,
    ) -> Duration {
        let BreakerError::Inner(FetchError::Source(source_error)) = error else {
            return delay;
        };
        let Some(retry_after) = source_error.retry_after() else {
            return delay;
        };

        self.rate_limiter()
            .record_rate_limit(source, retry_after)
            .await;
        delay.max(retry_after).min(self.policy.max_delay())
    }

    fn rate_limiter(&self) -> &RateLimiter {
        self.orchestrator.sources().rate_limiter()
    }

    async fn complete(&self, task: &Task, outcome: FetchOutcome) {
        let from_cache = outcome.from_cache;
        let result = self
            .commit(|| self.queue.complete_task(&task.id, outcome.clone()))
            .await;
        match result {
            Ok(()) if from_cache => self.stats.increment_cached(),
            Ok(()) => self.stats.increment_completed(),
            Err(e) => {
                error!(error = %e, "failed to record task completion");
                self.release(task, &format!("failed to record completion: {e}"))
                    .await;
            }
        }
    }

    async fn fail(&self, task: &Task, message: &str) {
        match self.commit(|| self.queue.fail_task(&task.id, message)).await {
            Ok(Some(TaskStatus::Pending)) => self.stats.increment_requeued(),
            Ok(Some(TaskStatus::Failed)) => self.stats.increment_failed(),
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "failed to record task failure");
                self.release(task, &format!("{message}; failed to record failure: {e}"))
                    .await;
            }
        }
    }

    /// Runs a queue write, retrying while the database is contended.
    async fn commit<T, F, Fut>(&self, mut write: F) -> Result<T, QueueError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        let mut attempt = 1;
        loop {
            match write().await {
                Err(e) if e.is_transient() && attempt < COMMIT_ATTEMPTS => {
                    warn!(attempt, error = %e, "queue write contended, retrying");
                    tokio::time::sleep(COMMIT_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Takes a task out of the running set after its outcome was lost.
    async fn release(&self, task: &Task, reason: &str) {
        if self.queue.release_task(&task.id, reason).await {
            self.stats.increment_failed();
        }
    }
}
