//! Durable priority queue of fetch tasks.
//!
//! The queue keeps every [`Task`] in memory behind one mutex and mirrors each
//! mutation to the `tasks` table before the call returns, so a crash after
//! any successful call loses nothing.
//!
//! # Overview
//!
//! - [`TaskQueue`] - Queue operations (enqueue, dequeue, complete, fail, cancel)
//! - [`Task`] - One fetch task with its lifecycle metadata
//! - [`TaskStatus`] - Lifecycle states
//! - [`QueueError`] - Operation error types
//!
//! Pending tasks are ordered by ascending priority, ties broken by enqueue
//! order. A task is always in exactly one of: the pending ordering, the
//! running set, or a terminal status.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use harvester_core::config::QueueConfig;
//! use harvester_core::queue::{Task, TaskQueue};
//! use harvester_core::Database;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new_in_memory().await?;
//! let queue = TaskQueue::open(db, &QueueConfig::default()).await?;
//!
//! queue.enqueue(Task::new("arxiv", "graph learning").with_priority(1)).await?;
//!
//! if let Some(task) = queue.dequeue(Duration::from_secs(1)).await? {
//!     // ... fetch ...
//!     queue.fail_task(&task.id, "network error").await?;
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod store;
mod task;

pub use error::QueueError;
pub use task::{Task, TaskId, TaskStatus};

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::QueueConfig;
use crate::db::Database;
use crate::orchestrator::FetchOutcome;

/// Result type for queue operations.
pub type Result<T> = std::result::Result<T, QueueError>;

#[derive(Debug, Default)]
struct QueueState {
    tasks: HashMap<TaskId, Task>,
    pending: BTreeMap<(i64, u64), TaskId>,
    running: HashSet<TaskId>,
    next_seq: u64,
}

impl QueueState {
    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Detaches `task` from the pending ordering and running set.
    fn unlink(&mut self, task: &Task) {
        self.pending.remove(&task.pending_key());
        self.running.remove(&task.id);
    }

    /// Stores `task` and links it where its status says it belongs.
    fn commit(&mut self, task: Task) {
        if let Some(previous) = self.tasks.get(&task.id).cloned() {
            self.unlink(&previous);
        }
        match task.status {
            TaskStatus::Pending => {
                self.pending.insert(task.pending_key(), task.id.clone());
            }
            TaskStatus::Running => {
                self.running.insert(task.id.clone());
            }
            _ => {}
        }
        self.tasks.insert(task.id.clone(), task);
    }
}

/// Durable priority task queue.
///
/// Cheap to share behind an `Arc`; all operations take `&self`.
#[derive(Debug)]
pub struct TaskQueue {
    db: Database,
    state: Mutex<QueueState>,
    available: Notify,
    max_size: Option<usize>,
    retry_priority_penalty: i64,
}

impl TaskQueue {
    /// Opens the queue, reloading every stored task.
    ///
    /// Tasks left RUNNING by a previous process are reset to PENDING and
    /// rejoin the pending ordering.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if loading or re-persisting fails,
    /// or [`QueueError::Serialization`] if a stored row is corrupt.
    #[instrument(skip(db, config))]
    pub async fn open(db: Database, config: &QueueConfig) -> Result<Self> {
        let mut state = QueueState::default();
        let mut recovered = 0_usize;

        for mut task in store::load_tasks(db.pool()).await? {
            if task.status == TaskStatus::Running {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                store::upsert_task(db.pool(), &task).await?;
                recovered += 1;
            }
            state.next_seq = state.next_seq.max(task.seq + 1);
            state.commit(task);
        }

        if recovered > 0 {
            info!(recovered, "recovered interrupted tasks from previous run");
        }
        debug!(
            total = state.tasks.len(),
            pending = state.pending.len(),
            "task queue loaded"
        );

        Ok(Self {
            db,
            state: Mutex::new(state),
            available: Notify::new(),
            max_size: config.max_size,
            retry_priority_penalty: config.retry_priority_penalty,
        })
    }

    /// Adds a task to the pending ordering and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Capacity`] if the pending ordering is full,
    /// [`QueueError::DuplicateTask`] if the id is already known, or
    /// [`QueueError::Database`] if persisting fails.
    #[instrument(skip(self, task), fields(task_id = %task.id, source = %task.source, priority = task.priority))]
    pub async fn enqueue(&self, mut task: Task) -> Result<TaskId> {
        let mut state = self.state.lock().await;

        if let Some(max) = self.max_size.filter(|max| state.pending.len() >= *max) {
            warn!(max, "queue full, rejecting task");
            return Err(QueueError::Capacity { max });
        }
        if state.tasks.contains_key(&task.id) {
            return Err(QueueError::DuplicateTask(task.id));
        }

        task.status = TaskStatus::Pending;
        task.seq = state.next_seq;
        store::upsert_task(self.db.pool(), &task).await?;
        state.take_seq();

        let id = task.id.clone();
        state.commit(task);
        drop(state);

        self.available.notify_waiters();
        debug!("task enqueued");
        Ok(id)
    }

    /// Claims the next pending task, waiting up to `timeout` for one.
    ///
    /// Returns `None` on timeout.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if persisting the claim fails; the
    /// task then stays pending.
    #[instrument(skip(self))]
    pub async fn dequeue(&self, timeout: Duration) -> Result<Option<Task>> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.try_claim().await? {
                return Ok(Some(task));
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn try_claim(&self) -> Result<Option<Task>> {
        let mut state = self.state.lock().await;
        let Some(id) = state.pending.values().next().cloned() else {
            return Ok(None);
        };
        let Some(mut task) = state.tasks.get(&id).cloned() else {
            return Ok(None);
        };

        task.status = TaskStatus::Running;
        task.started_at = Some(Utc::now());
        store::upsert_task(self.db.pool(), &task).await?;

        debug!(task_id = %task.id, priority = task.priority, "task claimed");
        state.commit(task.clone());
        Ok(Some(task))
    }

    /// Records a successful run: COMPLETED, or CACHED if served from cache.
    ///
    /// No-op for unknown ids. A task cancelled while running stays CANCELLED.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if persisting fails.
    #[instrument(skip(self, outcome), fields(records = outcome.records.len(), from_cache = outcome.from_cache))]
    pub async fn complete_task(&self, id: &TaskId, outcome: FetchOutcome) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(mut task) = state.tasks.get(id).cloned() else {
            debug!(task_id = %id, "complete for unknown task ignored");
            return Ok(());
        };
        if task.status == TaskStatus::Cancelled {
            info!(task_id = %id, "task was cancelled while running, keeping cancelled");
            return Ok(());
        }

        task.status = if outcome.from_cache {
            TaskStatus::Cached
        } else {
            TaskStatus::Completed
        };
        task.records_fetched = outcome.records.len() as u64;
        task.pages_fetched = outcome.pages_fetched;
        task.records = outcome.records;
        task.completed_at = Some(Utc::now());
        task.error = None;

        store::upsert_task(self.db.pool(), &task).await?;
        debug!(task_id = %id, status = %task.status, "task completed");
        state.commit(task);
        Ok(())
    }

    /// Records a failed run.
    ///
    /// Increments `retry_count`; while it stays below `max_retries` the task
    /// returns to PENDING with its priority raised by the retry penalty,
    /// otherwise it becomes FAILED. Returns the resulting status, or `None`
    /// for unknown ids. A cancelled task stays CANCELLED.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if persisting fails.
    #[instrument(skip(self, error))]
    pub async fn fail_task(&self, id: &TaskId, error: &str) -> Result<Option<TaskStatus>> {
        let mut state = self.state.lock().await;
        let Some(mut task) = state.tasks.get(id).cloned() else {
            debug!(task_id = %id, "fail for unknown task ignored");
            return Ok(None);
        };
        if task.status == TaskStatus::Cancelled {
            info!(task_id = %id, "task was cancelled while running, keeping cancelled");
            return Ok(Some(TaskStatus::Cancelled));
        }

        task.retry_count += 1;
        task.error = Some(error.to_string());

        if task.retry_count < task.max_retries {
            task.status = TaskStatus::Pending;
            task.priority = task.priority.saturating_add(self.retry_priority_penalty);
            task.seq = state.next_seq;
            task.started_at = None;
            store::upsert_task(self.db.pool(), &task).await?;
            state.take_seq();

            warn!(
                task_id = %id,
                retry_count = task.retry_count,
                max_retries = task.max_retries,
                priority = task.priority,
                error,
                "task failed, requeued with priority penalty"
            );
            state.commit(task);
            drop(state);
            self.available.notify_waiters();
            return Ok(Some(TaskStatus::Pending));
        }

        task.status = TaskStatus::Failed;
        store::upsert_task(self.db.pool(), &task).await?;
        warn!(
            task_id = %id,
            retry_count = task.retry_count,
            error,
            "task failed permanently"
        );
        state.commit(task);
        Ok(Some(TaskStatus::Failed))
    }

    /// Cancels a pending or running task.
    ///
    /// Returns `true` if the task was cancelled by this call; `false` for
    /// unknown ids and tasks already in a terminal status. A running task's
    /// worker notices at its next attempt boundary.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if persisting fails.
    #[instrument(skip(self))]
    pub async fn cancel_task(&self, id: &TaskId) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(mut task) = state.tasks.get(id).cloned() else {
            return Ok(false);
        };
        if task.status.is_terminal() {
            debug!(task_id = %id, status = %task.status, "cancel ignored for finished task");
            return Ok(false);
        }

        task.status = TaskStatus::Cancelled;
        store::upsert_task(self.db.pool(), &task).await?;
        info!(task_id = %id, "task cancelled");
        state.commit(task);
        Ok(true)
    }

    /// Moves every RUNNING task back to PENDING.
    ///
    /// Used after workers were force-stopped mid-task. Returns how many tasks
    /// were reset.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Database`] if persisting fails.
    #[instrument(skip(self))]
    pub async fn reset_running(&self) -> Result<usize> {
        let mut state = self.state.lock().await;
        let mut running: Vec<Task> = state
            .running
            .iter()
            .filter_map(|id| state.tasks.get(id).cloned())
            .collect();
        running.sort_by_key(|t| t.seq);

        let count = running.len();
        for mut task in running {
            task.status = TaskStatus::Pending;
            task.started_at = None;
            store::upsert_task(self.db.pool(), &task).await?;
            state.commit(task);
        }
        drop(state);

        if count > 0 {
            info!(count, "reset running tasks to pending");
            self.available.notify_waiters();
        }
        Ok(count)
    }

    /// Marks a RUNNING task FAILED in memory only.
    ///
    /// Last resort for a worker whose outcome could not be persisted: the
    /// task leaves the running set so the pool can drain, while its stored
    /// row stays RUNNING and is recovered as PENDING on the next open.
    /// Returns false if the task is not running.
    #[instrument(skip(self))]
    pub async fn release_task(&self, id: &TaskId, reason: &str) -> bool {
        let mut state = self.state.lock().await;
        let Some(mut task) = state
            .tasks
            .get(id)
            .filter(|t| t.status == TaskStatus::Running)
            .cloned()
        else {
            return false;
        };

        task.status = TaskStatus::Failed;
        task.error = Some(reason.to_string());
        task.completed_at = Some(Utc::now());
        warn!(task_id = %id, reason, "released task without persisting its outcome");
        state.commit(task);
        true
    }

    /// Returns a snapshot of a task.
    pub async fn get_task(&self, id: &TaskId) -> Option<Task> {
        self.state.lock().await.tasks.get(id).cloned()
    }

    /// Returns true if the task exists and is CANCELLED.
    pub async fn is_cancelled(&self, id: &TaskId) -> bool {
        self.state
            .lock()
            .await
            .tasks
            .get(id)
            .is_some_and(|t| t.status == TaskStatus::Cancelled)
    }

    /// Returns snapshots of all tasks, oldest enqueue first.
    pub async fn get_all_tasks(&self) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state.tasks.values().cloned().collect();
        tasks.sort_by_key(|t| (t.created_at, t.seq));
        tasks
    }

    /// Returns snapshots of tasks in `status`, oldest enqueue first.
    pub async fn get_tasks_by_status(&self, status: TaskStatus) -> Vec<Task> {
        let state = self.state.lock().await;
        let mut tasks: Vec<Task> = state
            .tasks
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        tasks.sort_by_key(|t| (t.created_at, t.seq));
        tasks
    }

    /// Number of pending tasks.
    pub async fn size(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Number of tasks currently claimed by workers.
    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    /// Returns true when nothing is pending or running.
    pub async fn is_idle(&self) -> bool {
        let state = self.state.lock().await;
        state.pending.is_empty() && state.running.is_empty()
    }

    /// Priority penalty applied on requeue.
    #[must_use]
    pub fn retry_priority_penalty(&self) -> i64 {
        self.retry_priority_penalty
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_RETRY_PRIORITY_PENALTY;
    use crate::source::Record;

    async fn queue() -> TaskQueue {
        let db = Database::new_in_memory().await.unwrap();
        TaskQueue::open(db, &QueueConfig::default()).await.unwrap()
    }

    fn outcome(records: Vec<Record>, from_cache: bool) -> FetchOutcome {
        FetchOutcome {
            records,
            from_cache,
            pages_fetched: 1,
        }
    }

    const SHORT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn test_dequeue_orders_by_priority_then_fifo() {
        let queue = queue().await;
        let a = queue.enqueue(Task::new("s", "a").with_priority(10)).await.unwrap();
        let b = queue.enqueue(Task::new("s", "b").with_priority(1)).await.unwrap();
        let c = queue.enqueue(Task::new("s", "c").with_priority(5)).await.unwrap();
        let d = queue.enqueue(Task::new("s", "d").with_priority(5)).await.unwrap();

        let mut order = Vec::new();
        while let Some(task) = queue.dequeue(SHORT).await.unwrap() {
            order.push(task.id);
        }
        assert_eq!(order, vec![b, c, d, a]);
    }

    #[tokio::test]
    async fn test_dequeue_marks_running_and_times_out_when_empty() {
        let queue = queue().await;
        assert!(queue.dequeue(SHORT).await.unwrap().is_none());

        let id = queue.enqueue(Task::new("s", "q")).await.unwrap();
        let task = queue.dequeue(SHORT).await.unwrap().unwrap();
        assert_eq!(task.id, id);
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());
        assert_eq!(queue.size().await, 0);
        assert_eq!(queue.running_count().await, 1);
    }

    #[tokio::test]
    async fn test_dequeue_wakes_on_enqueue() {
        let queue = std::sync::Arc::new(queue().await);
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = queue.enqueue(Task::new("s", "q")).await.unwrap();

        let task = waiter.await.unwrap().unwrap().unwrap();
        assert_eq!(task.id, id);
    }

    #[tokio::test]
    async fn test_release_task_only_frees_running_tasks() {
        let queue = queue().await;
        let pending = queue.enqueue(Task::new("s", "a")).await.unwrap();
        assert!(!queue.release_task(&pending, "lost").await);

        let running = queue.dequeue(SHORT).await.unwrap().unwrap();
        assert!(queue.release_task(&running.id, "lost").await);

        let task = queue.get_task(&running.id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("lost"));
        assert_eq!(queue.running_count().await, 0);
        assert!(queue.is_idle().await);
        assert!(!queue.release_task(&running.id, "again").await);
    }

    #[tokio::test]
    async fn test_capacity_limit() {
        let db = Database::new_in_memory().await.unwrap();
        let config = QueueConfig {
            max_size: Some(1),
            ..QueueConfig::default()
        };
        let queue = TaskQueue::open(db, &config).await.unwrap();

        queue.enqueue(Task::new("s", "a")).await.unwrap();
        let err = queue.enqueue(Task::new("s", "b")).await.unwrap_err();
        assert!(matches!(err, QueueError::Capacity { max: 1 }));
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_rejected() {
        let queue = queue().await;
        let task = Task::new("s", "a");
        queue.enqueue(task.clone()).await.unwrap();
        assert!(matches!(
            queue.enqueue(task).await.unwrap_err(),
            QueueError::DuplicateTask(_)
        ));
    }

    #[tokio::test]
    async fn test_complete_task_sets_status_and_records() {
        let queue = queue().await;
        let id = queue.enqueue(Task::new("s", "q")).await.unwrap();
        queue.dequeue(SHORT).await.unwrap();

        queue
            .complete_task(&id, outcome(vec![Record::new("1", "t")], true))
            .await
            .unwrap();

        let task = queue.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cached);
        assert_eq!(task.records_fetched, 1);
        assert!(task.completed_at.is_some());
        assert_eq!(queue.running_count().await, 0);
        assert!(queue.is_idle().await);
    }

    #[tokio::test]
    async fn test_complete_unknown_task_is_noop() {
        let queue = queue().await;
        queue
            .complete_task(&TaskId::new(), outcome(Vec::new(), false))
            .await
            .unwrap();
        assert!(queue.get_all_tasks().await.is_empty());
    }

    #[tokio::test]
    async fn test_fail_task_requeues_with_penalty_then_fails() {
        let queue = queue().await;
        let id = queue
            .enqueue(Task::new("s", "q").with_priority(1).with_max_retries(2))
            .await
            .unwrap();

        queue.dequeue(SHORT).await.unwrap();
        let status = queue.fail_task(&id, "first").await.unwrap();
        assert_eq!(status, Some(TaskStatus::Pending));
        let task = queue.get_task(&id).await.unwrap();
        assert_eq!(task.priority, 1 + DEFAULT_RETRY_PRIORITY_PENALTY);
        assert_eq!(task.retry_count, 1);
        assert_eq!(queue.size().await, 1);

        queue.dequeue(SHORT).await.unwrap();
        let status = queue.fail_task(&id, "second").await.unwrap();
        assert_eq!(status, Some(TaskStatus::Failed));

        let task = queue.get_task(&id).await.unwrap();
        assert_eq!(task.retry_count, 2);
        assert_eq!(task.error.as_deref(), Some("second"));
        assert_eq!(queue.size().await, 0);
        assert_eq!(queue.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_requeued_task_sinks_below_fresh_work() {
        let queue = queue().await;
        let failing = queue.enqueue(Task::new("s", "a").with_priority(0)).await.unwrap();
        let fresh = queue.enqueue(Task::new("s", "b").with_priority(5)).await.unwrap();

        queue.dequeue(SHORT).await.unwrap();
        queue.fail_task(&failing, "boom").await.unwrap();

        assert_eq!(queue.dequeue(SHORT).await.unwrap().unwrap().id, fresh);
        assert_eq!(queue.dequeue(SHORT).await.unwrap().unwrap().id, failing);
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let queue = queue().await;
        let id = queue.enqueue(Task::new("s", "q")).await.unwrap();

        assert!(queue.cancel_task(&id).await.unwrap());
        assert_eq!(queue.size().await, 0);
        assert!(queue.is_cancelled(&id).await);
        assert!(queue.dequeue(SHORT).await.unwrap().is_none());
        assert!(!queue.cancel_task(&id).await.unwrap());
        assert!(!queue.cancel_task(&TaskId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancelled_running_task_is_not_overwritten() {
        let queue = queue().await;
        let id = queue.enqueue(Task::new("s", "q")).await.unwrap();
        queue.dequeue(SHORT).await.unwrap();
        queue.cancel_task(&id).await.unwrap();
        assert_eq!(queue.running_count().await, 0);

        queue
            .complete_task(&id, outcome(vec![Record::new("1", "t")], false))
            .await
            .unwrap();
        assert_eq!(
            queue.get_task(&id).await.unwrap().status,
            TaskStatus::Cancelled
        );
        assert_eq!(
            queue.fail_task(&id, "late").await.unwrap(),
            Some(TaskStatus::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_reset_running_requeues_claimed_tasks() {
        let queue = queue().await;
        let id = queue.enqueue(Task::new("s", "q")).await.unwrap();
        queue.dequeue(SHORT).await.unwrap();

        assert_eq!(queue.reset_running().await.unwrap(), 1);
        assert_eq!(queue.get_task(&id).await.unwrap().status, TaskStatus::Pending);
        assert_eq!(queue.size().await, 1);
        assert_eq!(queue.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_tasks_by_status() {
        let queue = queue().await;
        let a = queue.enqueue(Task::new("s", "a")).await.unwrap();
        queue.enqueue(Task::new("s", "b")).await.unwrap();
        queue.cancel_task(&a).await.unwrap();

        let cancelled = queue.get_tasks_by_status(TaskStatus::Cancelled).await;
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, a);
        assert_eq!(queue.get_tasks_by_status(TaskStatus::Pending).await.len(), 1);
        assert_eq!(queue.get_all_tasks().await.len(), 2);
    }
}
