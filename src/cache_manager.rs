/**
Cache manager for the link-in-bio client

Owns one synchronization cache wired to the HTTP backend, plus the trigger
listener that feeds it reconnect/foreground/interval events. Create it at
startup, pass it (or clones of its cache) to whoever needs data, and shut it
down on exit.
*/
use crate::cache::{
    RefetchTrigger, ResourceCache, SharedFetcher, SyncConfig, TriggerListener,
    config::{DEFAULT_ADMIN_STALE_SECS, DEFAULT_LINKS_STALE_SECS, DEFAULT_NOTIFICATIONS_STALE_SECS},
};
use crate::error::Result;
use crate::http_fetcher::{HttpFetcher, WriteRequest};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Resource classes served by the backend
pub const RESOURCES: [&str; 3] = ["links", "notifications", "admin"];

pub type AppCache = ResourceCache<Value, WriteRequest>;

pub struct CacheManager {
    cache: AppCache,
    triggers: mpsc::Sender<RefetchTrigger>,
    listener: TriggerListener,
    cancel: CancellationToken,
}

impl CacheManager {
    /// Build the cache, register the HTTP fetcher for every resource class
    /// and start the trigger listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be built
    #[allow(clippy::unused_async)]
    pub async fn initialize(config: SyncConfig, base_url: &str) -> Result<Self> {
        let fetcher = HttpFetcher::new(base_url)?;
        info!("🚀 Initializing cache against {}", fetcher.base_url());
        Ok(Self::with_fetcher(config, Arc::new(fetcher)))
    }

    /// Same as [`Self::initialize`] with a caller-supplied fetcher serving
    /// every resource class.
    #[must_use]
    pub fn with_fetcher(config: SyncConfig, fetcher: SharedFetcher<Value, WriteRequest>) -> Self {
        let cache = AppCache::new(config);
        for resource in RESOURCES {
            cache.register_shared(resource, Arc::clone(&fetcher));
        }

        let cancel = CancellationToken::new();
        let (triggers, receiver) = TriggerListener::channel();
        let listener = TriggerListener::spawn(cache.clone(), receiver, cancel.clone());

        info!("✅ Cache initialized ({} resources)", RESOURCES.len());
        Self {
            cache,
            triggers,
            listener,
            cancel,
        }
    }

    /// Defaults tuned per resource class: notifications always revalidate,
    /// admin listings change rarely.
    #[must_use]
    pub fn default_config() -> SyncConfig {
        SyncConfig::default()
            .with_stale_time("links", Duration::from_secs(DEFAULT_LINKS_STALE_SECS))
            .with_stale_time(
                "notifications",
                Duration::from_secs(DEFAULT_NOTIFICATIONS_STALE_SECS),
            )
            .with_stale_time("admin", Duration::from_secs(DEFAULT_ADMIN_STALE_SECS))
    }

    #[must_use]
    pub const fn cache(&self) -> &AppCache {
        &self.cache
    }

    /// Sender for external triggers, e.g. a network-status watcher.
    #[must_use]
    pub fn trigger_sender(&self) -> mpsc::Sender<RefetchTrigger> {
        self.triggers.clone()
    }

    pub async fn notify_reconnected(&self) {
        self.send(RefetchTrigger::Reconnected).await;
    }

    pub async fn notify_foregrounded(&self) {
        self.send(RefetchTrigger::Foregrounded).await;
    }

    async fn send(&self, trigger: RefetchTrigger) {
        if self.triggers.send(trigger).await.is_err() {
            warn!("Trigger listener is gone, dropping {} trigger", trigger);
        }
    }

    /// Stop the listener, then drop every entry and subscription.
    pub async fn shutdown(self) {
        info!("🛑 Shutting down cache manager");
        self.cancel.cancel();
        self.listener.shutdown().await;
        self.cache.shutdown();
    }
}
