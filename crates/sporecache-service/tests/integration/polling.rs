use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use sporecache_service::polling::{PollState, PollerOptions};
use sporecache_service::scheduler::TokioScheduler;

use crate::{JsonServer, Reply, eventually, setup_fetcher};

fn options(max_attempts: u32) -> PollerOptions {
    PollerOptions {
        max_attempts,
        base_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(100),
    }
}

fn missing_description(record: &Value) -> bool {
    record["description"].is_null()
}

#[tokio::test]
async fn test_auto_fetch_detail_until_complete() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();
    server
        .reply("species/7", Reply::ok(json!({"id": 7, "description": null})))
        .reply("species/7", Reply::ok(json!({"id": 7, "description": null})))
        .reply("species/7", Reply::ok(json!({"id": 7, "description": "Fly agaric"})));

    let updates: Arc<Mutex<Vec<PollState<Value>>>> = Default::default();
    let poller = {
        let updates = Arc::clone(&updates);
        fetcher.auto_fetch_detail(
            Some(server.url("species/7")),
            missing_description,
            options(5),
            Ok,
            TokioScheduler::shared(),
            move |state: &PollState<Value>| updates.lock().unwrap().push(state.clone()),
        )
    };

    eventually(Duration::from_secs(5), || poller.state().is_settled()).await;

    let state = poller.state();
    assert_eq!(state.data.unwrap()["description"], "Fly agaric");
    assert_eq!(state.attempt, 2);
    assert!(!state.gave_up);
    assert_eq!(server.hits("species/7"), 3);
    assert!(updates.lock().unwrap().first().unwrap().loading);
}

#[tokio::test]
async fn test_auto_fetch_detail_gives_up() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();
    server.reply("species/7", Reply::ok(json!({"id": 7, "description": null})));

    let poller = fetcher.auto_fetch_detail(
        Some(server.url("species/7")),
        |name: &String| name.is_empty(),
        options(2),
        |record: Value| Ok(record["description"].as_str().unwrap_or_default().to_owned()),
        TokioScheduler::shared(),
        |_: &PollState<String>| {},
    );

    eventually(Duration::from_secs(5), || poller.state().is_settled()).await;

    let state = poller.state();
    assert!(state.gave_up);
    assert_eq!(state.data.as_deref(), Some(""));
    assert_eq!(server.hits("species/7"), 3);
}

#[tokio::test]
async fn test_auto_fetch_detail_missing_record() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();

    let poller = fetcher.auto_fetch_detail(
        Some(server.url("species/404")),
        missing_description,
        options(5),
        Ok,
        TokioScheduler::shared(),
        |_: &PollState<Value>| {},
    );

    eventually(Duration::from_secs(5), || poller.state().is_settled()).await;

    let state = poller.state();
    assert_eq!(state.error, Some(sporecache_service::caching::FetchError::NotFound));
    assert_eq!(server.hits("species/404"), 1);
}
