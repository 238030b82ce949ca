use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;

use crate::caching::{FetchError, Fetcher};
use crate::config::HttpConfig;
use crate::polling::{CompletionPoller, PollState, PollerOptions};
use crate::scheduler::SchedulerRef;

/// Creates a [`reqwest::Client`] with the provided options.
///
/// * `timeout` bounds a whole request, including reading the body.
/// * `connect_timeout` bounds establishing the connection.
/// * Every request carries the configured `User-Agent`.
pub fn create_client(config: &HttpConfig) -> Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .gzip(true)
        .user_agent(&config.user_agent)
        .connect_timeout(config.connect_timeout)
        .timeout(config.timeout)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .context("failed to create HTTP client")
}

/// Fetches JSON documents and maps every failure to a [`FetchError`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: create_client(config)?,
            timeout: config.timeout,
        })
    }

    /// Downloads `url` and decodes the body as JSON.
    ///
    /// A `404` is [`FetchError::NotFound`], other error statuses are [`FetchError::Failed`] with
    /// the response body attached.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, FetchError> {
        tracing::trace!(%url, "Fetching JSON");
        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|err| self.request_error(err))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::debug!(%url, %status, "Unexpected response status");
            return Err(FetchError::Failed(format!("{status}: {}", body.trim())));
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| self.request_error(err))?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn request_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(self.timeout)
        } else {
            err.into()
        }
    }

    /// A [`Fetcher`] that loads `url` as JSON, for use with the resource cache.
    pub fn json<T>(&self, url: Url) -> impl Fetcher<T> + use<T>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let this = self.clone();
        move || {
            let this = this.clone();
            let url = url.clone();
            async move { this.fetch_json(url).await }
        }
    }

    /// Polls the JSON record at `url` until `is_incomplete` is satisfied.
    ///
    /// Every response is decoded as JSON and passed through `transform` before it reaches the
    /// predicate and `on_update`, pass [`Ok`] to keep the raw document. The returned poller
    /// already fetches `url`. A `None` url leaves it idle until a target is set.
    pub fn auto_fetch_detail<T, P, X, U>(
        &self,
        url: Option<Url>,
        is_incomplete: P,
        options: PollerOptions,
        transform: X,
        scheduler: SchedulerRef,
        on_update: U,
    ) -> CompletionPoller<Url, T>
    where
        T: Clone + Send + Sync + 'static,
        P: Fn(&T) -> bool + Send + Sync + 'static,
        X: Fn(serde_json::Value) -> Result<T, FetchError> + Send + Sync + 'static,
        U: Fn(&PollState<T>) + Send + Sync + 'static,
    {
        let this = self.clone();
        let transform = Arc::new(transform);
        let fetch = move |url: &Url| {
            let this = this.clone();
            let url = url.clone();
            let transform = Arc::clone(&transform);
            async move {
                let document = this.fetch_json(url).await?;
                transform(document)
            }
        };

        let poller = CompletionPoller::new(fetch, is_incomplete, options, scheduler, on_update);
        poller.set_target(url);
        poller
    }
}
