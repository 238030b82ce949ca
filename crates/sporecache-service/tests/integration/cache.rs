use std::time::Duration;

use futures::future;
use serde_json::{Value, json};
use sporecache_service::caching::{QueryConfig, ResourceCache};
use sporecache_service::config::CacheConfig;
use sporecache_service::scheduler::TokioScheduler;

use crate::{JsonServer, Reply, eventually, setup_fetcher};

fn cache() -> ResourceCache<Value> {
    let config = CacheConfig {
        gc_interval: Duration::ZERO,
        ..Default::default()
    };
    ResourceCache::new(config, TokioScheduler::shared())
}

#[tokio::test]
async fn test_concurrent_loads_hit_backend_once() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();
    server.reply(
        "species/42",
        Reply::ok(json!({"id": 42})).delayed(Duration::from_millis(100)),
    );

    let cache = cache();
    let url = server.url("species/42");
    let query = QueryConfig::default();
    let loads = (0..8).map(|_| cache.load(url.clone(), fetcher.json(url.clone()), &query));
    let results = future::join_all(loads).await;

    for result in results {
        assert_eq!(result.unwrap(), json!({"id": 42}));
    }
    assert_eq!(server.hits("species/42"), 1);
}

#[tokio::test]
async fn test_stale_while_revalidate() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();
    server
        .reply("species/42", Reply::ok(json!({"rev": 1})))
        .reply("species/42", Reply::ok(json!({"rev": 2})));

    let cache = cache();
    let url = server.url("species/42");
    let query = QueryConfig::default().with_stale_time(Duration::from_millis(100));

    let data = cache.load(url.clone(), fetcher.json(url.clone()), &query).await;
    assert_eq!(data.unwrap(), json!({"rev": 1}));

    tokio::time::sleep(Duration::from_millis(150)).await;
    let snapshot = cache.get(url.clone(), fetcher.json(url.clone()), &query);
    assert_eq!(snapshot.data, Some(json!({"rev": 1})));
    assert!(snapshot.is_validating);

    eventually(Duration::from_secs(5), || {
        cache.peek(url.as_str()) == Some(json!({"rev": 2}))
    })
    .await;
    assert_eq!(server.hits("species/42"), 2);
}

#[tokio::test]
async fn test_backend_outage_serves_last_known_good() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();
    server
        .reply("species/42", Reply::ok(json!({"rev": 1})))
        .reply("species/42", Reply::status(reqwest::StatusCode::SERVICE_UNAVAILABLE));

    let cache = cache();
    let url = server.url("species/42");
    let query = QueryConfig::default()
        .with_stale_time(Duration::ZERO)
        .with_retries(1, Duration::from_millis(10));

    let data = cache.load(url.clone(), fetcher.json(url.clone()), &query).await;
    assert_eq!(data.unwrap(), json!({"rev": 1}));

    tokio::time::sleep(Duration::from_millis(10)).await;
    let result = cache.revalidate(url.clone()).await;
    assert!(result.is_err());

    let entry = cache.read(url.as_str()).unwrap();
    assert_eq!(entry.data, json!({"rev": 1}));
    assert!(entry.error.is_some());
    assert_eq!(server.hits("species/42"), 3);
}
