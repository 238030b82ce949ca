use std::time::Duration;

use sporecache_service::config::HttpConfig;
use sporecache_service::utils::http::HttpFetcher;
use sporecache_test as test;

pub use test::{JsonServer, Reply};

/// Sets up logging and creates a fetcher with the given request timeout.
pub fn setup_fetcher(timeout: Duration) -> HttpFetcher {
    test::setup();

    let config = HttpConfig {
        timeout,
        ..Default::default()
    };
    HttpFetcher::new(&config).unwrap()
}

/// Waits until `done` returns true, checking every few milliseconds.
///
/// # Panics
///
/// Panics if `done` does not become true within `limit`.
pub async fn eventually(limit: Duration, mut done: impl FnMut() -> bool) {
    let start = tokio::time::Instant::now();
    while !done() {
        assert!(start.elapsed() < limit, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
