use super::entry::{CacheEntry, EntrySnapshot, FetchStatus};
use super::key::CacheKey;
use super::locks;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

/// Keyed entry storage. Every operation holds the lock for the whole
/// transition, so readers only ever see an entry before or after an update.
#[derive(Debug)]
pub struct CacheStore<V> {
    entries: RwLock<HashMap<CacheKey, CacheEntry<V>>>,
    max_entries: usize,
}

impl<V: Clone> CacheStore<V> {
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries,
        }
    }

    #[must_use]
    pub const fn max_entries(&self) -> usize {
        self.max_entries
    }

    #[must_use]
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        locks::read(&self.entries, "cache store").get(key).cloned()
    }

    #[must_use]
    pub fn snapshot(&self, key: &CacheKey) -> Option<EntrySnapshot<V>> {
        locks::read(&self.entries, "cache store")
            .get(key)
            .map(CacheEntry::snapshot)
    }

    #[must_use]
    pub fn contains(&self, key: &CacheKey) -> bool {
        locks::read(&self.entries, "cache store").contains_key(key)
    }

    /// Store `entry` under its own key, replacing any previous entry.
    pub fn put(&self, entry: CacheEntry<V>) {
        debug!("💾 Cache STORE: {}", entry.key());
        locks::write(&self.entries, "cache store").insert(entry.key().clone(), entry);
    }

    pub fn remove(&self, key: &CacheKey) -> Option<CacheEntry<V>> {
        locks::write(&self.entries, "cache store").remove(key)
    }

    /// Remove every entry whose key matches `prefix`, returning the removed keys.
    pub fn remove_by_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        let mut entries = locks::write(&self.entries, "cache store");
        let matching: Vec<CacheKey> = entries
            .keys()
            .filter(|key| key.matches_prefix(prefix))
            .cloned()
            .collect();
        for key in &matching {
            entries.remove(key);
        }
        drop(entries);

        if !matching.is_empty() {
            info!("🧹 Cache REMOVE: {} ({} entries)", prefix, matching.len());
        }
        matching
    }

    /// Invalidate every entry whose key matches `prefix`. Idle entries are
    /// removed; an entry with a fetch in flight is emptied but keeps the
    /// fetch registered. Returns what observers of each key should now see.
    pub fn invalidate_by_prefix(&self, prefix: &CacheKey) -> Vec<EntrySnapshot<V>> {
        let snapshots = self.invalidate_where(|key| key.matches_prefix(prefix));
        if !snapshots.is_empty() {
            info!("🧹 Cache INVALIDATE: {} ({} entries)", prefix, snapshots.len());
        }
        snapshots
    }

    pub fn invalidate(&self, key: &CacheKey) -> Option<EntrySnapshot<V>> {
        let snapshot = self.invalidate_where(|candidate| candidate == key).pop();
        if snapshot.is_some() {
            info!("🧹 Cache INVALIDATE: {}", key);
        }
        snapshot
    }

    fn invalidate_where(&self, matches: impl Fn(&CacheKey) -> bool) -> Vec<EntrySnapshot<V>> {
        let mut entries = locks::write(&self.entries, "cache store");
        let mut snapshots = Vec::new();
        entries.retain(|key, entry| {
            if !matches(key) {
                return true;
            }
            if entry.invalidate() {
                snapshots.push(entry.snapshot());
                true
            } else {
                snapshots.push(EntrySnapshot::empty(key.clone()));
                false
            }
        });
        snapshots
    }

    /// Read-modify-write of one entry, creating an empty entry on first access.
    pub fn update<R>(&self, key: &CacheKey, f: impl FnOnce(&mut CacheEntry<V>) -> R) -> R {
        let mut entries = locks::write(&self.entries, "cache store");
        let entry = entries
            .entry(key.clone())
            .or_insert_with(|| CacheEntry::new(key.clone()));
        f(entry)
    }

    /// Read-modify-write of an entry that must already exist.
    pub fn update_existing<R>(
        &self,
        key: &CacheKey,
        f: impl FnOnce(&mut CacheEntry<V>) -> R,
    ) -> Option<R> {
        locks::write(&self.entries, "cache store")
            .get_mut(key)
            .map(f)
    }

    /// Apply `f` to every entry matching `prefix`; returns snapshots of the
    /// entries for which `f` reported a change.
    pub fn update_matching(
        &self,
        prefix: &CacheKey,
        mut f: impl FnMut(&mut CacheEntry<V>) -> bool,
    ) -> Vec<EntrySnapshot<V>> {
        locks::write(&self.entries, "cache store")
            .values_mut()
            .filter(|entry| entry.key().matches_prefix(prefix))
            .filter_map(|entry| f(entry).then(|| entry.snapshot()))
            .collect()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<CacheKey> {
        locks::read(&self.entries, "cache store").keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        locks::read(&self.entries, "cache store").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evict idle entries, least recently accessed first, until the store is
    /// back within `max_entries`. Keys for which `protect` holds are kept.
    pub fn evict_lru(&self, protect: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let mut entries = locks::write(&self.entries, "cache store");
        let mut evicted = Vec::new();

        while entries.len() > self.max_entries {
            let oldest_key = entries
                .iter()
                .filter(|(key, entry)| entry.is_idle() && !protect(key))
                .min_by_key(|(_, entry)| entry.last_accessed())
                .map(|(key, _)| key.clone());

            let Some(key) = oldest_key else {
                break;
            };
            entries.remove(&key);
            evicted.push(key);
        }

        evicted
    }

    /// Drop every entry, returning how many were held.
    pub fn clear(&self) -> usize {
        let mut entries = locks::write(&self.entries, "cache store");
        let count = entries.len();
        entries.clear();
        count
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let entries = locks::read(&self.entries, "cache store");
        let mut stats = CacheStats {
            total_entries: entries.len(),
            max_entries: self.max_entries,
            ..CacheStats::default()
        };

        for entry in entries.values() {
            match entry.status() {
                FetchStatus::Empty => stats.empty_entries += 1,
                FetchStatus::Fetching => stats.fetching_entries += 1,
                FetchStatus::Fresh => stats.fresh_entries += 1,
                FetchStatus::Stale => stats.stale_entries += 1,
                FetchStatus::Failed => stats.failed_entries += 1,
            }
            stats.pending_mutations += entry.pending_mutations();
        }

        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub empty_entries: usize,
    pub fetching_entries: usize,
    pub fresh_entries: usize,
    pub stale_entries: usize,
    pub failed_entries: usize,
    pub pending_mutations: usize,
    pub max_entries: usize,
}

impl CacheStats {
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization_percent(&self) -> f64 {
        if self.max_entries == 0 {
            return 0.0;
        }
        (self.total_entries as f64 / self.max_entries as f64) * 100.0
    }
}
