use super::entry::EntrySnapshot;
use super::key::CacheKey;
use super::locks;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use uuid::Uuid;

pub type Observer<V> = Arc<dyn Fn(&EntrySnapshot<V>) + Send + Sync>;

struct Subscription<V> {
    id: Uuid,
    observer: Observer<V>,
}

/// Observers per exact key, invoked synchronously on every entry change.
pub struct SubscriptionManager<V> {
    subscriptions: RwLock<HashMap<CacheKey, Vec<Subscription<V>>>>,
}

impl<V> Default for SubscriptionManager<V> {
    fn default() -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> SubscriptionManager<V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        self: &Arc<Self>,
        key: CacheKey,
        observer: impl Fn(&EntrySnapshot<V>) + Send + Sync + 'static,
    ) -> SubscriptionHandle<V> {
        let id = Uuid::new_v4();
        locks::write(&self.subscriptions, "subscriptions")
            .entry(key.clone())
            .or_default()
            .push(Subscription {
                id,
                observer: Arc::new(observer),
            });

        SubscriptionHandle {
            id,
            key,
            registry: Arc::downgrade(self),
            active: AtomicBool::new(true),
        }
    }

    /// Subscribe with a channel instead of a callback. Snapshots queue up
    /// until received; a dropped receiver is ignored.
    pub fn subscribe_channel(
        self: &Arc<Self>,
        key: CacheKey,
    ) -> (SubscriptionHandle<V>, mpsc::UnboundedReceiver<EntrySnapshot<V>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.subscribe(key, move |snapshot| {
            let _ = tx.send(snapshot.clone());
        });
        (handle, rx)
    }

    pub fn subscribe_stream(
        self: &Arc<Self>,
        key: CacheKey,
    ) -> (SubscriptionHandle<V>, UnboundedReceiverStream<EntrySnapshot<V>>) {
        let (handle, rx) = self.subscribe_channel(key);
        (handle, UnboundedReceiverStream::new(rx))
    }

    /// Remove one subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, key: &CacheKey, id: Uuid) -> bool {
        let mut subs = locks::write(&self.subscriptions, "subscriptions");
        let Some(observers) = subs.get_mut(key) else {
            return false;
        };

        let before = observers.len();
        observers.retain(|s| s.id != id);
        let removed = observers.len() != before;

        // Clean up empty entries
        if observers.is_empty() {
            subs.remove(key);
        }
        removed
    }

    /// Invoke every observer of `key` with `snapshot`, returning how many ran.
    ///
    /// Observers run after the registry lock is released, so they may
    /// subscribe, unsubscribe or read the cache themselves.
    pub fn notify(&self, key: &CacheKey, snapshot: &EntrySnapshot<V>) -> usize {
        let observers: Vec<Observer<V>> = locks::read(&self.subscriptions, "subscriptions")
            .get(key)
            .map(|subs| subs.iter().map(|s| Arc::clone(&s.observer)).collect())
            .unwrap_or_default();

        for observer in &observers {
            observer(snapshot);
        }
        observers.len()
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        locks::read(&self.subscriptions, "subscriptions")
            .values()
            .map(Vec::len)
            .sum()
    }

    #[must_use]
    pub fn has_subscribers(&self, key: &CacheKey) -> bool {
        locks::read(&self.subscriptions, "subscriptions").contains_key(key)
    }

    #[must_use]
    pub fn subscribed_keys(&self) -> Vec<CacheKey> {
        locks::read(&self.subscriptions, "subscriptions")
            .keys()
            .cloned()
            .collect()
    }

    /// Release every subscription, returning how many were active.
    pub fn clear(&self) -> usize {
        let mut subs = locks::write(&self.subscriptions, "subscriptions");
        let count = subs.values().map(Vec::len).sum();
        subs.clear();
        count
    }
}

/// Keeps a subscription alive; dropping it unsubscribes.
pub struct SubscriptionHandle<V: Clone + Send + Sync + 'static> {
    id: Uuid,
    key: CacheKey,
    registry: Weak<SubscriptionManager<V>>,
    active: AtomicBool,
}

impl<V: Clone + Send + Sync + 'static> SubscriptionHandle<V> {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Idempotent: only the first call has an effect.
    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            if let Some(registry) = self.registry.upgrade() {
                registry.unsubscribe(&self.key, self.id);
            }
        }
    }
}

impl<V: Clone + Send + Sync + 'static> Drop for SubscriptionHandle<V> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl<V: Clone + Send + Sync + 'static> std::fmt::Debug for SubscriptionHandle<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("active", &self.is_active())
            .finish()
    }
}
