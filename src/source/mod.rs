//! Record source adapters: the seam between the engine and upstream APIs.
//!
//! The engine never talks HTTP itself. Each upstream search API is wrapped in
//! a [`RecordSource`] that streams [`SourceEvent`]s for a [`FetchRequest`] and
//! fails with a typed [`SourceError`]. Adapters are created fresh for every
//! task execution through a [`SourceRegistry`] factory; the registry hands
//! each new adapter a [`SourceContext`] carrying the task's config map and the
//! process-wide [`RateLimiter`], so concurrent workers share one request
//! budget per source.
//!
//! # Example
//!
//! ```
//! use futures_util::stream::{self, StreamExt};
//! use harvester_core::source::{
//!     FetchRequest, Record, RecordSource, RecordStream, SourceContext, SourceEvent,
//!     SourceRegistry, RateLimiter,
//! };
//! use std::sync::Arc;
//!
//! struct Static;
//!
//! #[async_trait::async_trait]
//! impl RecordSource for Static {
//!     fn name(&self) -> &str {
//!         "static"
//!     }
//!
//!     fn stream(&self, request: FetchRequest) -> RecordStream<'_> {
//!         let record = Record::new("1", request.query);
//!         stream::iter(vec![Ok(SourceEvent::Record(record))]).boxed()
//!     }
//! }
//!
//! let mut registry = SourceRegistry::new(Arc::new(RateLimiter::disabled()));
//! registry.register("static", |_ctx: &SourceContext| Ok(Box::new(Static)));
//! assert!(registry.contains("static"));
//! ```

mod error;
pub mod rate_limiter;
mod record;

pub use error::SourceError;
pub use rate_limiter::{RateLimiter, parse_retry_after};
pub use record::{FetchRequest, PageCheckpoint, Record, SourceEvent};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};
use tracing::debug;

/// Lazy, finite stream of events from one adapter.
pub type RecordStream<'a> = BoxStream<'a, Result<SourceEvent, SourceError>>;

/// An upstream search API.
///
/// Implementations handle pagination, response parsing and their own request
/// pacing (via [`SourceContext::rate_limiter`]). A stream ends when the
/// upstream result set is exhausted; the first `Err` item ends the fetch.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Source name, matching its registry key.
    fn name(&self) -> &str;

    /// Streams records for `request`, resuming from its offset/cursor if set.
    fn stream(&self, request: FetchRequest) -> RecordStream<'_>;

    /// Releases held resources (connections, sessions).
    async fn close(&self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Everything a factory needs to build an adapter for one task.
#[derive(Debug, Clone)]
pub struct SourceContext {
    /// Registry key of the source being built.
    pub source_name: String,
    /// Task-specific adapter configuration (API keys, page sizes, filters).
    pub config: Map<String, Value>,
    /// Process-wide limiter shared by every adapter instance.
    pub rate_limiter: Arc<RateLimiter>,
}

impl SourceContext {
    /// Waits for this source's next request slot.
    pub async fn acquire(&self) {
        self.rate_limiter.acquire(&self.source_name).await;
    }

    /// Reads a string option from the task config.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// Reads an unsigned integer option from the task config.
    #[must_use]
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(Value::as_u64)
    }
}

/// Builds a fresh adapter for one task execution.
pub type SourceFactory =
    Arc<dyn Fn(&SourceContext) -> Result<Box<dyn RecordSource>, SourceError> + Send + Sync>;

/// Maps source names to adapter factories.
#[derive(Clone)]
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
    rate_limiter: Arc<RateLimiter>,
}

impl fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("sources", &self.names())
            .field("rate_limiter", &self.rate_limiter)
            .finish()
    }
}

impl SourceRegistry {
    /// Creates an empty registry whose adapters share `rate_limiter`.
    #[must_use]
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            factories: HashMap::new(),
            rate_limiter,
        }
    }

    /// Registers (or replaces) the factory for `name`.
    #[tracing::instrument(skip(self, factory))]
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&SourceContext) -> Result<Box<dyn RecordSource>, SourceError>
            + Send
            + Sync
            + 'static,
    {
        debug!("registering source adapter");
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Returns true if a factory is registered for `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered source names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// The limiter handed to every adapter.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Builds a new adapter for `name` with the given task config.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Validation`] if no factory is registered for
    /// `name`, or whatever the factory itself returns.
    pub fn create(
        &self,
        name: &str,
        config: &Map<String, Value>,
    ) -> Result<Box<dyn RecordSource>, SourceError> {
        let Some(factory) = self.factories.get(name) else {
            return Err(SourceError::validation(
                name,
                format!(
                    "no adapter registered for source '{name}' (known: {})",
                    self.names().join(", ")
                ),
            ));
        };

        let ctx = SourceContext {
            source_name: name.to_string(),
            config: config.clone(),
            rate_limiter: Arc::clone(&self.rate_limiter),
        };
        factory(&ctx)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use futures_util::stream::{self, StreamExt};

    use super::*;

    struct Echo {
        name: String,
        page_size: u64,
    }

    #[async_trait]
    impl RecordSource for Echo {
        fn name(&self) -> &str {
            &self.name
        }

        fn stream(&self, request: FetchRequest) -> RecordStream<'_> {
            let records: Vec<Result<SourceEvent, SourceError>> = (0..self.page_size)
                .map(|i| Ok(SourceEvent::Record(Record::new(i.to_string(), &request.query))))
                .collect();
            stream::iter(records).boxed()
        }
    }

    fn registry() -> SourceRegistry {
        let mut registry = SourceRegistry::new(Arc::new(RateLimiter::disabled()));
        registry.register("echo", |ctx: &SourceContext| {
            Ok(Box::new(Echo {
                name: ctx.source_name.clone(),
                page_size: ctx.config_u64("page_size").unwrap_or(1),
            }))
        });
        registry
    }

    #[test]
    fn test_create_unknown_source_is_validation_error() {
        let err = registry().create("nope", &Map::new()).err().unwrap();
        assert!(matches!(err, SourceError::Validation { .. }));
        assert!(err.to_string().contains("echo"));
    }

    #[tokio::test]
    async fn test_create_passes_task_config_to_factory() {
        let mut config = Map::new();
        config.insert("page_size".to_string(), Value::from(3));

        let source = registry().create("echo", &config).unwrap();
        let events: Vec<_> = source.stream(FetchRequest::new("q")).collect().await;

        assert_eq!(source.name(), "echo");
        assert_eq!(events.len(), 3);
        assert!(source.close().await.is_ok());
    }

    #[test]
    fn test_names_sorted() {
        let mut registry = registry();
        registry.register("arxiv", |_ctx: &SourceContext| Err(SourceError::other("arxiv", "x")));
        assert_eq!(registry.names(), vec!["arxiv", "echo"]);
        assert!(registry.contains("arxiv"));
    }
}
