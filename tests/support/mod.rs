//! Shared fakes and helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use harvester_core::config::HarvestConfig;
use harvester_core::{
    FetchManager, FetchRequest, PageCheckpoint, Record, RecordSource, RecordStream,
    SourceContext, SourceError, SourceEvent, SourceRegistry,
};

static TRACING: Once = Once::new();

/// Installs a fmt subscriber when `RUST_LOG` is set.
pub fn init_tracing() {
    TRACING.call_once(|| {
        if std::env::var_os("RUST_LOG").is_some() {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        }
    });
}

/// Config with millisecond delays and no request spacing.
pub fn fast_config(num_workers: usize) -> HarvestConfig {
    let mut config = HarvestConfig::default();
    config.worker.num_workers = num_workers;
    config.worker.max_attempts = 3;
    config.worker.poll_interval_ms = 20;
    config.worker.completion_poll_ms = 10;
    config.worker.shutdown_timeout_ms = 2000;
    config.backoff.base_delay_ms = 1;
    config.backoff.max_delay_ms = 5;
    config.rate_limit.default_interval_ms = 0;
    config
}

/// Behaviour of a [`Scripted`] source.
#[derive(Clone)]
pub struct Script {
    /// Records yielded per fetch, two per page.
    pub records: usize,
    /// Number of leading stream calls that fail.
    pub failures: usize,
    /// Error returned by failing calls.
    pub error: SourceError,
    /// Total stream calls across every adapter instance.
    pub calls: Arc<AtomicUsize>,
}

impl Script {
    pub fn ok(records: usize) -> Self {
        Self {
            records,
            failures: 0,
            error: SourceError::other("scripted", "unused"),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing(error: SourceError) -> Self {
        Self {
            records: 1,
            failures: usize::MAX,
            error,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Registers this script under `name`.
    pub fn register(&self, registry: &mut SourceRegistry, name: &str) {
        let script = self.clone();
        registry.register(name, move |ctx: &SourceContext| {
            Ok(Box::new(Scripted {
                name: ctx.source_name.clone(),
                script: script.clone(),
            }))
        });
    }
}

/// Fake adapter driven by a [`Script`].
pub struct Scripted {
    name: String,
    script: Script,
}

#[async_trait]
impl RecordSource for Scripted {
    fn name(&self) -> &str {
        &self.name
    }

    fn stream(&self, request: FetchRequest) -> RecordStream<'_> {
        let call = self.script.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.script.failures {
            return stream::iter(vec![Err(self.script.error.clone())]).boxed();
        }

        let start = usize::try_from(request.offset).unwrap_or(usize::MAX);
        let mut events = Vec::new();
        for i in start..self.script.records {
            events.push(Ok(SourceEvent::Record(
                Record::new(format!("{}-{i}", request.query), format!("{} #{i}", request.query))
                    .with_source(self.name.clone()),
            )));
            if i % 2 == 1 {
                events.push(Ok(SourceEvent::Page(PageCheckpoint {
                    page_number: (i / 2 + 1) as u64,
                    raw_response: None,
                    offset: Some((i + 1) as u64),
                    cursor: None,
                })));
            }
        }
        stream::iter(events).boxed()
    }
}

/// Registry with `script` registered as source `s`.
pub fn registry_with(config: &HarvestConfig, script: &Script) -> SourceRegistry {
    let mut registry = FetchManager::registry_for(config);
    script.register(&mut registry, "s");
    registry
}
