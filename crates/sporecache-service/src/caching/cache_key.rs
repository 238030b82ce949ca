use std::borrow::Borrow;
use std::fmt;
use std::sync::Arc;

/// Identifies one logical resource in a [`ResourceCache`](super::ResourceCache).
///
/// Keys are opaque: typically a URL plus the query parameters that influence the response.
/// Distinct keys are fully independent, there is no hierarchy and no invalidation cascade.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

impl From<&String> for CacheKey {
    fn from(key: &String) -> Self {
        Self(key.as_str().into())
    }
}

impl From<&CacheKey> for CacheKey {
    fn from(key: &CacheKey) -> Self {
        key.clone()
    }
}

impl From<url::Url> for CacheKey {
    fn from(url: url::Url) -> Self {
        Self(String::from(url).into())
    }
}

impl Borrow<str> for CacheKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
