use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

/// An error that happens while fetching a resource.
///
/// Errors are cloned to every consumer waiting on the same deduplicated fetch, and are kept on a
/// cache entry for diagnostics when a background revalidation fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The backend reported that the resource does not exist.
    #[error("not found")]
    NotFound,
    /// The backend did not answer in time.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    /// The fetch failed for another reason, like connection loss or a 5xx response.
    ///
    /// The attached string contains the backend's response or the transport error.
    #[error("fetch failed: {0}")]
    Failed(String),
    /// A response was received, but it could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
    /// A revalidation was requested for a key nobody has ever supplied a fetcher for.
    #[error("no fetcher registered for this key")]
    NoFetcher,
    /// The task running the fetch went away before it produced a result.
    #[error("fetch cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::Malformed(err.to_string());
        }
        match err.status() {
            Some(reqwest::StatusCode::NOT_FOUND) => Self::NotFound,
            _ => Self::Failed(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for FetchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Malformed(err.to_string())
    }
}

/// Produces a fresh value for a cache key.
///
/// Implemented for every `Fn() -> impl Future<Output = Result<T, FetchError>>`, so most callers
/// simply pass a closure. The cache never looks at how the value is obtained.
pub trait Fetcher<T>: Send + Sync + 'static {
    fn fetch(&self) -> BoxFuture<'static, Result<T, FetchError>>;
}

impl<T, F, Fut> Fetcher<T> for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
{
    fn fetch(&self) -> BoxFuture<'static, Result<T, FetchError>> {
        Box::pin(self())
    }
}
