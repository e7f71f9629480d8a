use super::config::SyncConfig;
use super::entry::{CacheEntry, EntrySnapshot, FetchStatus, SharedFetch};
use super::errors::CacheError;
use super::fetcher::{FetchError, Fetcher, FetcherRegistry, SharedFetcher};
use super::key::CacheKey;
use super::metrics::{SyncMetrics, SyncMetricsSnapshot};
use super::store::{CacheStats, CacheStore};
use super::subscription::{SubscriptionHandle, SubscriptionManager};
use super::triggers::RefetchTrigger;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOptions {
    /// Refetch even when the cached value is still fresh
    pub force_refetch: bool,
    /// Override the configured staleness threshold for this call
    pub stale_time: Option<Duration>,
}

impl ResolveOptions {
    #[must_use]
    pub fn forced() -> Self {
        Self {
            force_refetch: true,
            stale_time: None,
        }
    }

    #[must_use]
    pub const fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }
}

/// Where a resolved value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Fresh cached value, no adapter call
    Cache,
    /// Previously cached value served while a refetch runs or after it failed
    Stale,
    /// Value produced by the fetch this call waited for
    Network,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved<V> {
    pub value: V,
    pub origin: Origin,
    /// Last fetch failure, reported alongside a stale value
    pub error: Option<CacheError>,
}

pub(crate) struct CacheInner<V, P> {
    pub(crate) store: CacheStore<V>,
    pub(crate) subscriptions: Arc<SubscriptionManager<V>>,
    pub(crate) fetchers: FetcherRegistry<V, P>,
    pub(crate) config: SyncConfig,
    pub(crate) metrics: SyncMetrics,
    next_fetch_id: AtomicU64,
    pub(crate) next_mutation_id: AtomicU64,
}

/// Handle to an in-flight fetch obtained while holding the entry.
struct Claim<V> {
    future: SharedFetch<V>,
    started: bool,
}

enum Plan<V> {
    Hit(V),
    Revalidate {
        value: V,
        error: Option<CacheError>,
        claim: Claim<V>,
    },
    Wait(Claim<V>),
}

/// Resource synchronization cache.
///
/// Cheap to clone; every clone shares the same store, subscriptions and
/// fetcher registry. At most one fetch per key is in flight at any time:
/// concurrent resolves attach to the fetch already registered in the entry.
pub struct ResourceCache<V, P = V> {
    pub(crate) inner: Arc<CacheInner<V, P>>,
}

impl<V, P> Clone for ResourceCache<V, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, P> ResourceCache<V, P>
where
    V: Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    #[must_use]
    pub fn new(config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store: CacheStore::new(config.max_entries),
                subscriptions: Arc::new(SubscriptionManager::new()),
                fetchers: FetcherRegistry::new(),
                config,
                metrics: SyncMetrics::default(),
                next_fetch_id: AtomicU64::new(0),
                next_mutation_id: AtomicU64::new(0),
            }),
        }
    }

    /// Register the adapter serving every key of `resource`.
    pub fn register(
        &self,
        resource: impl Into<String>,
        fetcher: impl Fetcher<Value = V, Payload = P> + 'static,
    ) {
        self.register_shared(resource, Arc::new(fetcher));
    }

    pub fn register_shared(&self, resource: impl Into<String>, fetcher: SharedFetcher<V, P>) {
        let resource = resource.into();
        info!("🔌 Fetcher registered for {}", resource);
        if self.inner.fetchers.register(resource.clone(), fetcher).is_some() {
            warn!("Replaced existing fetcher for {}", resource);
        }
    }

    #[must_use]
    pub fn with_fetcher(
        self,
        resource: impl Into<String>,
        fetcher: impl Fetcher<Value = V, Payload = P> + 'static,
    ) -> Self {
        self.register(resource, fetcher);
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    /// Resolve `key`, serving from cache when possible.
    ///
    /// A stale value is returned immediately while one background refetch
    /// runs. Without a usable value the call waits for the (possibly shared)
    /// fetch; if that fails but an older value exists, the older value is
    /// returned together with the error.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` when no fetcher serves the key's resource, `FetchFailed`
    /// when the fetch failed and nothing was cached, `FetchAborted` when
    /// called outside a tokio runtime or the fetcher panicked.
    pub async fn resolve(
        &self,
        key: &CacheKey,
        options: ResolveOptions,
    ) -> Result<Resolved<V>, CacheError> {
        let fetcher = self.fetcher_for(key)?;
        let runtime = current_runtime(key)?;
        let stale_time = options
            .stale_time
            .unwrap_or_else(|| self.inner.config.stale_time_for(key.resource()));
        let trigger = if options.force_refetch {
            RefetchTrigger::Forced
        } else {
            RefetchTrigger::Access
        };
        let now = Instant::now();

        let plan = self.inner.store.update(key, |entry| {
            entry.touch(now);
            let stale = entry.is_stale(stale_time, now);
            match entry.value().cloned() {
                Some(value) if !options.force_refetch && !stale => Plan::Hit(value),
                Some(value) if !options.force_refetch => Plan::Revalidate {
                    value,
                    error: entry.error().cloned(),
                    claim: self.claim(entry, &fetcher),
                },
                _ => Plan::Wait(self.claim(entry, &fetcher)),
            }
        });
        self.evict_if_needed();

        match plan {
            Plan::Hit(value) => {
                self.inner.metrics.record_hit();
                debug!("🎯 Cache HIT: {}", key);
                Ok(Resolved {
                    value,
                    origin: Origin::Cache,
                    error: None,
                })
            }
            Plan::Revalidate { value, error, claim } => {
                self.inner.metrics.record_stale_hit();
                debug!("♻️ Cache STALE: {} (revalidating)", key);
                launch(&runtime, &claim, key, trigger);
                Ok(Resolved {
                    value,
                    origin: Origin::Stale,
                    error,
                })
            }
            Plan::Wait(claim) => {
                self.inner.metrics.record_miss();
                debug!("❌ Cache MISS: {}", key);
                launch(&runtime, &claim, key, trigger);
                match claim.future.await {
                    Ok(value) => Ok(Resolved {
                        value,
                        origin: Origin::Network,
                        error: None,
                    }),
                    Err(err) => match self.peek(key).and_then(|snapshot| snapshot.value) {
                        Some(value) => Ok(Resolved {
                            value,
                            origin: Origin::Stale,
                            error: Some(err),
                        }),
                        None => Err(err),
                    },
                }
            }
        }
    }

    /// Re-evaluate `key` for `trigger`, starting a background fetch when the
    /// entry is stale (or the trigger ignores staleness). Returns whether a
    /// new fetch was started; an in-flight fetch is never duplicated.
    pub fn revalidate(&self, key: &CacheKey, trigger: RefetchTrigger) -> bool {
        let Ok(fetcher) = self.fetcher_for(key) else {
            debug!("No fetcher for {}, skipping {} refetch", key, trigger);
            return false;
        };
        let Ok(runtime) = current_runtime(key) else {
            debug!("No runtime, skipping {} refetch of {}", trigger, key);
            return false;
        };
        let stale_time = self.inner.config.stale_time_for(key.resource());
        let now = Instant::now();

        let claim = self.inner.store.update(key, |entry| {
            let due = trigger.bypasses_staleness() || entry.is_stale(stale_time, now);
            due.then(|| self.claim(entry, &fetcher))
        });

        match claim {
            Some(claim) if claim.started => {
                launch(&runtime, &claim, key, trigger);
                true
            }
            _ => false,
        }
    }

    /// Run `trigger` against every key that currently has subscribers.
    /// Returns how many fetches were started.
    pub fn trigger(&self, trigger: RefetchTrigger) -> usize {
        let keys = self.inner.subscriptions.subscribed_keys();
        let started = keys
            .iter()
            .filter(|key| self.revalidate(key, trigger))
            .count();
        info!(
            "📡 Trigger {}: {} of {} subscribed keys refetching",
            trigger,
            started,
            keys.len()
        );
        started
    }

    /// Observe `key`. Attaching a subscriber refetches the key if stale.
    pub fn subscribe(
        &self,
        key: &CacheKey,
        observer: impl Fn(&EntrySnapshot<V>) + Send + Sync + 'static,
    ) -> SubscriptionHandle<V> {
        let handle = self.inner.subscriptions.subscribe(key.clone(), observer);
        self.revalidate(key, RefetchTrigger::SubscriberAttached);
        handle
    }

    pub fn subscribe_channel(
        &self,
        key: &CacheKey,
    ) -> (SubscriptionHandle<V>, mpsc::UnboundedReceiver<EntrySnapshot<V>>) {
        let subscription = self.inner.subscriptions.subscribe_channel(key.clone());
        self.revalidate(key, RefetchTrigger::SubscriberAttached);
        subscription
    }

    pub fn subscribe_stream(
        &self,
        key: &CacheKey,
    ) -> (SubscriptionHandle<V>, UnboundedReceiverStream<EntrySnapshot<V>>) {
        let subscription = self.inner.subscriptions.subscribe_stream(key.clone());
        self.revalidate(key, RefetchTrigger::SubscriberAttached);
        subscription
    }

    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionManager<V>> {
        &self.inner.subscriptions
    }

    /// Remove every entry matching `prefix` and no others. Observers of a
    /// removed key see an empty snapshot and the key is refetched while it
    /// still has subscribers. Returns how many entries were removed.
    ///
    /// An entry whose fetch is still running is emptied instead of removed:
    /// the fetch stays registered, so nothing starts a second read for the
    /// key. Its result lands stale and subscribed keys are refetched then.
    pub fn invalidate(&self, prefix: &CacheKey) -> usize {
        let invalidated = self.inner.store.invalidate_by_prefix(prefix);
        for snapshot in &invalidated {
            self.after_invalidation(snapshot);
        }
        invalidated.len()
    }

    pub fn invalidate_exact(&self, key: &CacheKey) -> bool {
        self.inner
            .store
            .invalidate(key)
            .inspect(|snapshot| self.after_invalidation(snapshot))
            .is_some()
    }

    /// Mark fresh entries under `prefix` stale without dropping their values.
    /// Subscribed keys are refetched. Returns how many entries changed.
    pub fn mark_stale(&self, prefix: &CacheKey) -> usize {
        let changed = self
            .inner
            .store
            .update_matching(prefix, CacheEntry::mark_stale);
        for snapshot in &changed {
            self.inner.subscriptions.notify(&snapshot.key, snapshot);
            if self.inner.subscriptions.has_subscribers(&snapshot.key) {
                self.revalidate(&snapshot.key, RefetchTrigger::Invalidation);
            }
        }
        changed.len()
    }

    /// Seed or overwrite the confirmed value of `key` as fresh. Pending
    /// optimistic deltas stay applied on top.
    pub fn set_value(&self, key: &CacheKey, value: V) {
        let now = Instant::now();
        let snapshot = self.inner.store.update(key, |entry| {
            entry.touch(now);
            entry.set_confirmed(value, now);
            entry.snapshot()
        });
        debug!("💾 Cache SET: {}", key);
        self.inner.subscriptions.notify(key, &snapshot);
        self.evict_if_needed();
    }

    #[must_use]
    pub fn peek(&self, key: &CacheKey) -> Option<EntrySnapshot<V>> {
        self.inner.store.snapshot(key)
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        self.inner.store.stats()
    }

    #[must_use]
    pub fn metrics(&self) -> SyncMetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Evict idle entries over capacity. Subscribed keys are never evicted.
    pub fn evict_idle(&self) -> Vec<CacheKey> {
        let subscriptions = &self.inner.subscriptions;
        let evicted = self
            .inner
            .store
            .evict_lru(|key| subscriptions.has_subscribers(key));
        for key in &evicted {
            debug!("🗑️ Cache EVICT: {}", key);
        }
        evicted
    }

    /// Drop every entry and release every subscription. In-flight fetches
    /// still resolve their waiters but are no longer written back.
    pub fn shutdown(&self) {
        let entries = self.inner.store.clear();
        let subscriptions = self.inner.subscriptions.clear();
        info!(
            "🛑 Cache shut down ({} entries dropped, {} subscriptions released)",
            entries, subscriptions
        );
    }

    pub(crate) fn notify(&self, snapshot: &EntrySnapshot<V>) {
        self.inner.subscriptions.notify(&snapshot.key, snapshot);
    }

    pub(crate) fn fetcher_for(&self, key: &CacheKey) -> Result<SharedFetcher<V, P>, CacheError> {
        self.inner
            .fetchers
            .get(key.resource())
            .ok_or_else(|| CacheError::KeyNotFound {
                key: key.to_string(),
            })
    }

    /// Join the entry's in-flight fetch or register a new one. Runs under
    /// the store lock, so the check and the registration are atomic.
    fn claim(&self, entry: &mut CacheEntry<V>, fetcher: &SharedFetcher<V, P>) -> Claim<V> {
        if let Some(in_flight) = entry.in_flight() {
            self.inner.metrics.record_deduplicated();
            debug!("🔗 FETCH JOIN: {}", entry.key());
            return Claim {
                future: in_flight.future.clone(),
                started: false,
            };
        }

        let id = self.inner.next_fetch_id.fetch_add(1, Ordering::Relaxed) + 1;
        let future = run_fetch(
            Arc::downgrade(&self.inner),
            Arc::clone(fetcher),
            entry.key().clone(),
            id,
        )
        .boxed()
        .shared();
        entry.begin_fetch(id, future.clone());
        self.inner.metrics.record_fetch_started();

        Claim {
            future,
            started: true,
        }
    }

    fn after_invalidation(&self, snapshot: &EntrySnapshot<V>) {
        self.notify(snapshot);
        if snapshot.status != FetchStatus::Fetching
            && self.inner.subscriptions.has_subscribers(&snapshot.key)
        {
            self.revalidate(&snapshot.key, RefetchTrigger::Invalidation);
        }
    }

    fn evict_if_needed(&self) {
        if self.inner.store.len() > self.inner.store.max_entries() {
            self.evict_idle();
        }
    }
}

pub(crate) fn current_runtime(key: &CacheKey) -> Result<Handle, CacheError> {
    Handle::try_current().map_err(|_| CacheError::FetchAborted {
        key: key.to_string(),
        reason: "no tokio runtime available".to_string(),
    })
}

/// Drive a newly registered fetch on its own task so that it completes even
/// when every caller stops waiting.
fn launch<V>(runtime: &Handle, claim: &Claim<V>, key: &CacheKey, trigger: RefetchTrigger)
where
    V: Clone + Send + Sync + 'static,
{
    if claim.started {
        debug!("🔄 Refetch on {}: {}", trigger, key);
        drop(runtime.spawn(claim.future.clone()));
    }
}

/// Body of one fetch: announce it, read with retries, write the outcome back
/// if the entry still belongs to this fetch, then notify.
async fn run_fetch<V, P>(
    inner: Weak<CacheInner<V, P>>,
    fetcher: SharedFetcher<V, P>,
    key: CacheKey,
    fetch_id: u64,
) -> Result<V, CacheError>
where
    V: Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    let Some(cache) = inner.upgrade() else {
        return Err(CacheError::FetchAborted {
            key: key.to_string(),
            reason: "cache dropped".to_string(),
        });
    };

    if let Some(snapshot) = cache.store.snapshot(&key) {
        cache.subscriptions.notify(&key, &snapshot);
    }
    let retry = cache.config.retry.clone();
    let timeout = cache.config.fetch_timeout;
    drop(cache);

    info!("🔄 FETCH START: {}", key);
    let outcome = AssertUnwindSafe(read_with_retry(&inner, &fetcher, &key, &retry, timeout))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!("💀 FETCH ABANDONED: {} (fetcher panicked)", key);
            Err(CacheError::FetchAborted {
                key: key.to_string(),
                reason: "fetcher panicked".to_string(),
            })
        });

    let Some(cache) = inner.upgrade() else {
        return outcome;
    };

    if outcome.is_err() {
        cache.metrics.record_fetch_failure();
    }

    let now = Instant::now();
    let snapshot = cache
        .store
        .update_existing(&key, |entry| {
            let applied = match &outcome {
                Ok(value) => entry.finish_fetch(fetch_id, value.clone(), now),
                Err(err) => entry.fail_fetch(fetch_id, err.clone()),
            };
            applied.then(|| entry.snapshot())
        })
        .flatten();

    match snapshot {
        Some(snapshot) => {
            cache.subscriptions.notify(&key, &snapshot);
            // Invalidated while running: the result predates the invalidation
            if snapshot.status == FetchStatus::Stale && cache.subscriptions.has_subscribers(&key) {
                ResourceCache { inner: cache }.revalidate(&key, RefetchTrigger::Invalidation);
            }
        }
        None => debug!("Discarding result of fetch #{} for {} (entry replaced)", fetch_id, key),
    }

    outcome
}

async fn read_with_retry<V, P>(
    inner: &Weak<CacheInner<V, P>>,
    fetcher: &SharedFetcher<V, P>,
    key: &CacheKey,
    retry: &super::config::RetryPolicy,
    timeout: Option<Duration>,
) -> Result<V, CacheError>
where
    V: Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, fetcher.read(key))
                .await
                .unwrap_or(Err(FetchError::Timeout(limit))),
            None => fetcher.read(key).await,
        };

        match result {
            Ok(value) => {
                info!("✅ FETCH SUCCESS: {} (attempt {})", key, attempt);
                return Ok(value);
            }
            Err(err) if attempt < max_attempts => {
                let delay = retry.delay_for(attempt);
                warn!(
                    "❌ FETCH FAILED: {} (attempt {}/{}), retrying in {:?}: {}",
                    key, attempt, max_attempts, delay, err
                );
                if let Some(cache) = inner.upgrade() {
                    cache.metrics.record_retry();
                }
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                error!(
                    "💀 FETCH ABANDONED: {} after {} attempts: {}",
                    key, attempt, err
                );
                return Err(CacheError::FetchFailed {
                    key: key.to_string(),
                    attempts: attempt,
                    source: err,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Counting {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl Fetcher for Counting {
        type Value = u32;
        type Payload = u32;

        async fn read(&self, _key: &CacheKey) -> Result<u32, FetchError> {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(u32::try_from(n).unwrap_or(u32::MAX) + 1)
        }

        async fn write(&self, _key: &CacheKey, payload: u32) -> Result<Option<u32>, FetchError> {
            Ok(Some(payload))
        }
    }

    fn key() -> CacheKey {
        CacheKey::parse("links:list").unwrap()
    }

    #[tokio::test]
    async fn test_fresh_hit_skips_fetcher() {
        let fetcher = Arc::new(Counting::default());
        let cache: ResourceCache<u32> = ResourceCache::new(SyncConfig::default());
        cache.register_shared("links", fetcher.clone());

        let first = cache.resolve(&key(), ResolveOptions::default()).await.unwrap();
        assert_eq!(first.origin, Origin::Network);
        assert_eq!(first.value, 1);

        let second = cache.resolve(&key(), ResolveOptions::default()).await.unwrap();
        assert_eq!(second.origin, Origin::Cache);
        assert_eq!(second.value, 1);
        assert_eq!(fetcher.reads.load(Ordering::SeqCst), 1);

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
    }

    #[tokio::test]
    async fn test_forced_refetch_waits_for_network() {
        let fetcher = Arc::new(Counting::default());
        let cache: ResourceCache<u32> = ResourceCache::new(SyncConfig::default());
        cache.register_shared("links", fetcher.clone());

        cache.resolve(&key(), ResolveOptions::default()).await.unwrap();
        let forced = cache.resolve(&key(), ResolveOptions::forced()).await.unwrap();
        assert_eq!(forced.origin, Origin::Network);
        assert_eq!(forced.value, 2);
    }

    #[tokio::test]
    async fn test_unknown_resource() {
        let cache: ResourceCache<u32> = ResourceCache::new(SyncConfig::default());
        let err = cache
            .resolve(&CacheKey::new("themes"), ResolveOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::KeyNotFound { .. }));
        assert!(cache.peek(&CacheKey::new("themes")).is_none());
    }

    #[tokio::test]
    async fn test_set_value_then_stale_override() {
        let fetcher = Arc::new(Counting::default());
        let cache: ResourceCache<u32> = ResourceCache::new(SyncConfig::default());
        cache.register_shared("links", fetcher.clone());

        cache.set_value(&key(), 42);
        let hit = cache.resolve(&key(), ResolveOptions::default()).await.unwrap();
        assert_eq!((hit.value, hit.origin), (42, Origin::Cache));

        let stale = cache
            .resolve(&key(), ResolveOptions::default().with_stale_time(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!((stale.value, stale.origin), (42, Origin::Stale));
    }
}
