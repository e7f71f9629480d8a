use super::key::CacheKey;
use super::locks;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

/// Any non-success outcome of a read or write against the remote side.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server responded {code}: {message}")]
    Status { code: u16, message: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The server rejected a write because its state moved underneath it.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("could not decode response: {0}")]
    Decode(String),

    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Whether the failure points at connectivity (offline, unreachable,
    /// too slow) rather than at the server's answer.
    #[must_use]
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Timeout(_))
    }
}

/// Adapter performing reads and writes against a remote resource.
///
/// Owned by the caller and registered per resource name; the cache never
/// inspects why an operation failed beyond the [`FetchError`] it returns.
#[async_trait]
pub trait Fetcher: Send + Sync {
    type Value: Clone + Send + Sync + 'static;
    type Payload: Send + 'static;

    async fn read(&self, key: &CacheKey) -> Result<Self::Value, FetchError>;

    /// Perform a write. `Ok(Some(value))` carries the server-confirmed
    /// resource, `Ok(None)` means the write was accepted without a body.
    async fn write(
        &self,
        key: &CacheKey,
        payload: Self::Payload,
    ) -> Result<Option<Self::Value>, FetchError>;
}

pub type SharedFetcher<V, P> = Arc<dyn Fetcher<Value = V, Payload = P>>;

/// Maps resource names to the adapter that serves them.
pub struct FetcherRegistry<V, P> {
    fetchers: RwLock<HashMap<String, SharedFetcher<V, P>>>,
}

impl<V, P> Default for FetcherRegistry<V, P> {
    fn default() -> Self {
        Self {
            fetchers: RwLock::new(HashMap::new()),
        }
    }
}

impl<V, P> FetcherRegistry<V, P> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fetcher` for `resource`, returning the adapter it replaced.
    pub fn register(
        &self,
        resource: impl Into<String>,
        fetcher: SharedFetcher<V, P>,
    ) -> Option<SharedFetcher<V, P>> {
        locks::write(&self.fetchers, "fetcher registry").insert(resource.into(), fetcher)
    }

    #[must_use]
    pub fn get(&self, resource: &str) -> Option<SharedFetcher<V, P>> {
        locks::read(&self.fetchers, "fetcher registry")
            .get(resource)
            .cloned()
    }

    #[must_use]
    pub fn resources(&self) -> Vec<String> {
        let mut names: Vec<String> = locks::read(&self.fetchers, "fetcher registry")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u32);

    #[async_trait]
    impl Fetcher for Fixed {
        type Value = u32;
        type Payload = u32;

        async fn read(&self, _key: &CacheKey) -> Result<u32, FetchError> {
            Ok(self.0)
        }

        async fn write(&self, _key: &CacheKey, payload: u32) -> Result<Option<u32>, FetchError> {
            Ok(Some(payload))
        }
    }

    #[test]
    fn test_connectivity_classification() {
        assert!(FetchError::Transport("reset".to_string()).is_connectivity());
        assert!(FetchError::Timeout(Duration::from_secs(1)).is_connectivity());
        assert!(!FetchError::Conflict("stale revision".to_string()).is_connectivity());
        assert!(
            !FetchError::Status {
                code: 500,
                message: String::new(),
            }
            .is_connectivity()
        );
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry: FetcherRegistry<u32, u32> = FetcherRegistry::new();
        assert!(registry.get("links").is_none());

        assert!(registry.register("links", Arc::new(Fixed(1))).is_none());
        assert!(registry.register("links", Arc::new(Fixed(2))).is_some());
        registry.register("admin", Arc::new(Fixed(3)));

        let fetcher = registry.get("links").unwrap();
        assert_eq!(fetcher.read(&CacheKey::new("links")).await.unwrap(), 2);
        assert_eq!(registry.resources(), vec!["admin".to_string(), "links".to_string()]);
    }
}
