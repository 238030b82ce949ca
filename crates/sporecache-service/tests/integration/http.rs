use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use sporecache_service::caching::FetchError;

use crate::{JsonServer, Reply, setup_fetcher};

#[derive(Debug, Deserialize, PartialEq)]
struct Species {
    id: u32,
    name: String,
}

#[tokio::test]
async fn test_fetch_json() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();
    server.reply("species/42", Reply::ok(json!({"id": 42, "name": "Amanita muscaria"})));

    let species: Species = fetcher.fetch_json(server.url("species/42")).await.unwrap();
    assert_eq!(
        species,
        Species {
            id: 42,
            name: "Amanita muscaria".into()
        }
    );
    assert_eq!(server.hits("species/42"), 1);
}

#[tokio::test]
async fn test_not_found() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();

    let result = fetcher
        .fetch_json::<Species>(server.url("species/404"))
        .await;
    assert_eq!(result, Err(FetchError::NotFound));
}

#[tokio::test]
async fn test_server_error() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();
    server.reply("species/1", Reply::status(StatusCode::BAD_GATEWAY));

    let result = fetcher.fetch_json::<Species>(server.url("species/1")).await;
    let message = match result {
        Err(FetchError::Failed(message)) => message,
        other => panic!("unexpected result: {other:?}"),
    };
    assert!(message.starts_with("502 Bad Gateway"), "{message}");
    assert!(message.contains("detail"), "{message}");
}

#[tokio::test]
async fn test_malformed_document() {
    let fetcher = setup_fetcher(Duration::from_secs(5));
    let server = JsonServer::new();
    server.reply("species/1", Reply::ok(json!({"id": "one"})));

    let result = fetcher.fetch_json::<Species>(server.url("species/1")).await;
    assert!(matches!(result, Err(FetchError::Malformed(_))), "{result:?}");
}

#[tokio::test]
async fn test_timeout() {
    let fetcher = setup_fetcher(Duration::from_millis(200));
    let server = JsonServer::new();
    server.reply(
        "species/1",
        Reply::ok(json!({"id": 1, "name": "Boletus edulis"})).delayed(Duration::from_secs(2)),
    );

    let result = fetcher.fetch_json::<Species>(server.url("species/1")).await;
    assert_eq!(result, Err(FetchError::Timeout(Duration::from_millis(200))));
}
