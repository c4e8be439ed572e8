//! A reqwest-backed source adapter against a wiremock server.
//!
//! Exercises the HTTP error mapping helpers on `SourceError` together with
//! the worker pool's retry and Retry-After handling.

mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use harvester_core::{
    FetchManager, FetchRequest, PageCheckpoint, Record, RecordSource, RecordStream,
    SearchRequest, SourceContext, SourceError, SourceEvent, SourceRegistry, TaskStatus,
};
use serde::Deserialize;
use support::{fast_config, init_tracing};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SOURCE: &str = "http";

#[derive(Deserialize)]
struct Page {
    items: Vec<Item>,
    next: Option<u64>,
}

#[derive(Deserialize)]
struct Item {
    id: String,
    title: String,
}

/// Offset-paginated JSON search API.
struct JsonSearch {
    client: reqwest::Client,
    base_url: String,
    ctx: SourceContext,
}

impl JsonSearch {
    async fn fetch_page(
        &self,
        query: &str,
        offset: u64,
    ) -> Result<(Vec<Result<SourceEvent, SourceError>>, Option<u64>), SourceError> {
        self.ctx.acquire().await;

        let url = format!("{}/search?q={query}&offset={offset}", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::from_reqwest(SOURCE, &e))?;
        let response = SourceError::check_response(SOURCE, response)?;
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::from_reqwest(SOURCE, &e))?;
        let page: Page =
            serde_json::from_str(&body).map_err(|e| SourceError::parse(SOURCE, e.to_string()))?;

        let fetched = page.items.len() as u64;
        let mut events: Vec<Result<SourceEvent, SourceError>> = page
            .items
            .into_iter()
            .map(|item| Ok(SourceEvent::Record(Record::new(item.id, item.title))))
            .collect();
        events.push(Ok(SourceEvent::Page(PageCheckpoint {
            page_number: offset / 2 + 1,
            raw_response: None,
            offset: Some(offset + fetched),
            cursor: None,
        })));
        Ok((events, page.next))
    }
}

#[async_trait]
impl RecordSource for JsonSearch {
    fn name(&self) -> &str {
        SOURCE
    }

    fn stream(&self, request: FetchRequest) -> RecordStream<'_> {
        stream::unfold(Some(request.offset), move |offset| {
            let query = request.query.clone();
            async move {
                let offset = offset?;
                match self.fetch_page(&query, offset).await {
                    Ok((events, next)) => Some((events, next)),
                    Err(error) => Some((vec![Err(error)], None)),
                }
            }
        })
        .flat_map(stream::iter)
        .boxed()
    }
}

fn registry(config: &harvester_core::HarvestConfig, server: &MockServer) -> SourceRegistry {
    let mut registry = FetchManager::registry_for(config);
    let base_url = server.uri();
    registry.register(SOURCE, move |ctx: &SourceContext| {
        Ok(Box::new(JsonSearch {
            client: reqwest::Client::new(),
            base_url: base_url.clone(),
            ctx: ctx.clone(),
        }))
    });
    registry
}

fn page_body(ids: &[&str], next: Option<u64>) -> serde_json::Value {
    serde_json::json!({
        "items": ids.iter().map(|id| serde_json::json!({"id": id, "title": format!("Paper {id}")})).collect::<Vec<_>>(),
        "next": next,
    })
}

#[tokio::test]
async fn test_paginated_api_is_fetched_and_cached() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["a", "b"], Some(2))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["c"], None)))
        .expect(1)
        .mount(&server)
        .await;

    let config = fast_config(1);
    let manager = FetchManager::new(config.clone(), registry(&config, &server))
        .await
        .unwrap();
    let id = manager
        .add_search(SearchRequest::new(SOURCE, "transformers"))
        .await
        .unwrap();
    manager.run().await.unwrap();

    let task = manager.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    let ids: Vec<_> = task.records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b", "c"]);
    assert_eq!(task.pages_fetched, 2);

    let query_id = task.cache_query_id.unwrap();
    let progress = manager
        .cache()
        .get_query_progress(&query_id)
        .await
        .unwrap()
        .unwrap();
    assert!(progress.completed);
    assert_eq!(progress.total_pages, 2);
    assert_eq!(progress.total_records, 3);
}

#[tokio::test]
async fn test_rate_limit_with_retry_after_is_honored() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(&["a"], None)))
        .mount(&server)
        .await;

    let mut config = fast_config(1);
    config.backoff.max_delay_ms = 5000;
    let registry = registry(&config, &server);
    let limiter = Arc::clone(registry.rate_limiter());
    let manager = FetchManager::new(config, registry).await.unwrap();

    let id = manager.add_search(SearchRequest::new(SOURCE, "q")).await.unwrap();
    let started = tokio::time::Instant::now();
    let stats = manager.run().await.unwrap();

    assert_eq!(manager.get_status(&id).await, Some(TaskStatus::Completed));
    assert_eq!(stats.retried, 1);
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(limiter.cumulative_delay(SOURCE) >= Duration::from_secs(1));
}

#[tokio::test]
async fn test_server_errors_fail_task_after_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let config = fast_config(1);
    let manager = FetchManager::new(config.clone(), registry(&config, &server))
        .await
        .unwrap();
    let id = manager
        .add_search(SearchRequest::new(SOURCE, "q").with_max_retries(1))
        .await
        .unwrap();
    manager.run().await.unwrap();

    let task = manager.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    let error = task.error.unwrap();
    assert!(error.starts_with("api_error"), "{error}");
    assert!(error.contains("HTTP 500 from http"), "{error}");
}

#[tokio::test]
async fn test_malformed_body_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let config = fast_config(1);
    let manager = FetchManager::new(config.clone(), registry(&config, &server))
        .await
        .unwrap();
    let id = manager
        .add_search(SearchRequest::new(SOURCE, "q").with_max_retries(1))
        .await
        .unwrap();
    manager.run().await.unwrap();

    let error = manager.get_task(&id).await.unwrap().error.unwrap();
    assert!(error.starts_with("parse_error"), "{error}");
}
