//! Runtime configuration for the harvesting engine.
//!
//! A single [`HarvestConfig`] is built once (defaults, or a JSON file via
//! [`HarvestConfig::from_json_file`]) and handed to the queue, cache,
//! breaker registry, rate limiter and worker pool. Every field has a default,
//! so a config file only needs to name what it overrides:
//!
//! ```json
//! { "worker": { "num_workers": 8 }, "breaker": { "failure_threshold": 3 } }
//! ```

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::db::DatabaseOptions;

/// Default number of concurrent workers.
pub const DEFAULT_NUM_WORKERS: usize = 4;

/// Default in-worker attempt budget per task execution.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default task-level requeue budget.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Priority penalty added each time a failed task is requeued.
pub const DEFAULT_RETRY_PRIORITY_PENALTY: i64 = 10;

const MIN_WORKERS: usize = 1;
const MAX_WORKERS: usize = 100;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file '{path}': {source}")]
    Read {
        /// Path that was read.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for [`HarvestConfig`].
    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        /// Path that was parsed.
        path: PathBuf,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A value is outside its accepted range.
    #[error("invalid config value for `{field}`: {value}. Expected range: {expected}")]
    Invalid {
        /// Dotted field path.
        field: &'static str,
        /// Offending value, rendered.
        value: String,
        /// Accepted range, rendered.
        expected: &'static str,
    },
}

/// Task queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum number of pending tasks; `None` means unbounded.
    pub max_size: Option<usize>,
    /// Requeue budget assigned to tasks that don't set their own.
    pub default_max_retries: u32,
    /// Added to a task's priority each time it is requeued after failure.
    pub retry_priority_penalty: i64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: None,
            default_max_retries: DEFAULT_MAX_RETRIES,
            retry_priority_penalty: DEFAULT_RETRY_PRIORITY_PENALTY,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers (1..=100).
    pub num_workers: usize,
    /// In-worker attempts per task execution.
    pub max_attempts: u32,
    /// How long an idle worker blocks in `dequeue` before re-checking the stop signal.
    pub poll_interval_ms: u64,
    /// Grace period for `stop` before stragglers are aborted.
    pub shutdown_timeout_ms: u64,
    /// Poll interval used by `wait_until_complete`.
    pub completion_poll_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: DEFAULT_NUM_WORKERS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            poll_interval_ms: 1000,
            shutdown_timeout_ms: 30_000,
            completion_poll_ms: 250,
        }
    }
}

impl WorkerConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    #[must_use]
    pub fn completion_poll(&self) -> Duration {
        Duration::from_millis(self.completion_poll_ms)
    }
}

/// Backoff delay bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Base delay fed into the per-kind formulas.
    pub base_delay_ms: u64,
    /// Hard cap on any single delay.
    pub max_delay_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
        }
    }
}

/// Circuit breaker thresholds, applied to every source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,
    /// Time an open breaker waits after the last failure before allowing a trial call.
    pub recovery_timeout_ms: u64,
    /// Consecutive half-open successes that close the breaker.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
            success_threshold: 2,
        }
    }
}

impl BreakerConfig {
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Per-source request spacing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Minimum interval between requests to one source; 0 disables limiting.
    pub default_interval_ms: u64,
    /// Overrides keyed by source name.
    pub per_source: HashMap<String, u64>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_interval_ms: 1000,
            per_source: HashMap::new(),
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// SQLite file for queue and cache state; `None` keeps everything in memory.
    pub database_path: Option<PathBuf>,
    /// Connection pool tuning.
    pub database: DatabaseOptions,
    /// Task queue settings.
    pub queue: QueueConfig,
    /// Worker pool settings.
    pub worker: WorkerConfig,
    /// Retry backoff settings.
    pub backoff: BackoffConfig,
    /// Circuit breaker settings.
    pub breaker: BreakerConfig,
    /// Rate limiter settings.
    pub rate_limit: RateLimitConfig,
}

impl HarvestConfig {
    /// Loads and validates a JSON config file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`], [`ConfigError::Parse`] or
    /// [`ConfigError::Invalid`].
    #[instrument(fields(path = %path.display()))]
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        debug!(?config, "loaded config file");
        Ok(config)
    }

    /// Checks every bounded value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let workers = self.worker.num_workers;
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
            return Err(invalid("worker.num_workers", workers, "1..=100"));
        }
        if self.worker.max_attempts == 0 {
            return Err(invalid("worker.max_attempts", 0, ">= 1"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(invalid("worker.poll_interval_ms", 0, ">= 1"));
        }
        if !(1..=20).contains(&self.database.max_connections) {
            return Err(invalid(
                "database.max_connections",
                self.database.max_connections,
                "1..=20",
            ));
        }
        if self.database.busy_timeout_ms > 120_000 {
            return Err(invalid(
                "database.busy_timeout_ms",
                self.database.busy_timeout_ms,
                "0..=120000",
            ));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(invalid(
                "backoff.base_delay_ms",
                self.backoff.base_delay_ms,
                "<= backoff.max_delay_ms",
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", 0, ">= 1"));
        }
        if self.breaker.success_threshold == 0 {
            return Err(invalid("breaker.success_threshold", 0, ">= 1"));
        }
        if self.queue.retry_priority_penalty < 0 {
            return Err(invalid(
                "queue.retry_priority_penalty",
                self.queue.retry_priority_penalty,
                ">= 0",
            ));
        }
        if self.queue.max_size == Some(0) {
            return Err(invalid("queue.max_size", 0, ">= 1 or null"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, value: impl ToString, expected: &'static str) -> ConfigError {
    ConfigError::Invalid {
        field,
        value: value.to_string(),
        expected,
    }
}
