//! Harvester Core Library
//!
//! Concurrent, resumable scheduling engine for fetching bibliographic records
//! from rate-limited, paginated search APIs. Searches become durable tasks in
//! a priority queue; a pool of workers executes them against pluggable
//! source adapters, retrying transient failures with kind-specific backoff
//! behind per-source circuit breakers, and writing every record through to a
//! resumable cache.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - Engine configuration and validation
//! - [`db`] - Database connection and schema management
//! - [`source`] - Record source trait, registry and shared rate limiter
//! - [`cache`] - Per-query progress and record cache
//! - [`queue`] - Durable priority task queue
//! - [`resilience`] - Error classification, backoff and circuit breakers
//! - [`orchestrator`] - Drives one fetch from adapter to cache
//! - [`worker`] - Worker pool with in-worker retry
//! - [`manager`] - Facade for scheduling and running searches

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod config;
pub mod db;
pub mod manager;
pub mod orchestrator;
pub mod queue;
pub mod resilience;
pub mod source;
pub mod worker;

// Re-export commonly used types
pub use cache::{CacheError, CacheRepository, QueryProgress, ResumableCache};
pub use config::{ConfigError, HarvestConfig};
pub use db::{Database, DatabaseOptions, DbError, DbErrorKind};
pub use manager::{FetchManager, ManagerError, SearchRequest};
pub use orchestrator::{FetchError, FetchOutcome, Orchestrator};
pub use queue::{QueueError, Task, TaskId, TaskQueue, TaskStatus};
pub use resilience::{
    BreakerError, BreakerRegistry, CircuitBreaker, CircuitState, Classify, ErrorKind,
    RetryDecision, RetryPolicy, classify_error,
};
pub use source::{
    FetchRequest, PageCheckpoint, RateLimiter, Record, RecordSource, RecordStream,
    SourceContext, SourceError, SourceEvent, SourceRegistry,
};
pub use worker::{PoolError, StatsSnapshot, WorkerPool, WorkerStats};
