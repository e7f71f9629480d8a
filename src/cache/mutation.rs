use super::engine::{ResourceCache, current_runtime};
use super::entry::Delta;
use super::errors::CacheError;
use super::fetcher::FetchError;
use super::key::CacheKey;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// An optimistic change to one key: the delta applied locally right away
/// and the payload sent through the key's fetcher.
///
/// The delta is replayed whenever the entry's projection is rebuilt, with the
/// store locked, so it must be a pure function of its input and must not call
/// back into the cache.
pub struct Mutation<V, P> {
    delta: Delta<V>,
    payload: P,
    invalidates: Vec<CacheKey>,
}

impl<V, P> Mutation<V, P> {
    pub fn new(payload: P, delta: impl Fn(Option<&V>) -> V + Send + Sync + 'static) -> Self {
        Self {
            delta: Arc::new(delta),
            payload,
            invalidates: Vec::new(),
        }
    }

    /// Invalidate every key under `prefix` once the write is confirmed.
    #[must_use]
    pub fn invalidates(mut self, prefix: CacheKey) -> Self {
        self.invalidates.push(prefix);
        self
    }
}

/// Rolls the optimistic delta back if the write task ends without settling,
/// e.g. when the write future panics or the runtime shuts down.
struct RollbackGuard<V, P>
where
    V: Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    cache: ResourceCache<V, P>,
    key: CacheKey,
    id: u64,
    armed: bool,
}

impl<V, P> Drop for RollbackGuard<V, P>
where
    V: Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            warn!("Mutation #{} on {} ended without settling", self.id, self.key);
            self.cache.rollback_mutation(&self.key, self.id);
        }
    }
}

impl<V, P> ResourceCache<V, P>
where
    V: Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    /// Apply `mutation` optimistically and write it through the fetcher
    /// registered for the key's resource.
    ///
    /// Returns the server-confirmed value when the write produced one.
    ///
    /// # Errors
    ///
    /// `KeyNotFound` without a fetcher and `FetchAborted` when the delta
    /// panics (nothing is applied or written in either case), `WriteFailed`
    /// or `ConcurrentMutationConflict` after the delta was rolled back.
    pub async fn mutate(
        &self,
        key: &CacheKey,
        mutation: Mutation<V, P>,
    ) -> Result<Option<V>, CacheError> {
        let fetcher = self.fetcher_for(key)?;
        let Mutation {
            delta,
            payload,
            invalidates,
        } = mutation;

        let write_key = key.clone();
        let write = async move { fetcher.write(&write_key, payload).await }.boxed();
        self.apply_mutation(key, delta, invalidates, write).await
    }

    /// Like [`Self::mutate`], with an arbitrary write operation instead of
    /// the registered fetcher.
    ///
    /// # Errors
    ///
    /// `FetchAborted` when the delta panics, `WriteFailed` or
    /// `ConcurrentMutationConflict` after the delta was rolled back.
    pub async fn mutate_with<F>(
        &self,
        key: &CacheKey,
        delta: impl Fn(Option<&V>) -> V + Send + Sync + 'static,
        invalidates: impl IntoIterator<Item = CacheKey>,
        write: F,
    ) -> Result<Option<V>, CacheError>
    where
        F: Future<Output = Result<Option<V>, FetchError>> + Send + 'static,
    {
        self.apply_mutation(
            key,
            Arc::new(delta),
            invalidates.into_iter().collect(),
            write.boxed(),
        )
        .await
    }

    async fn apply_mutation(
        &self,
        key: &CacheKey,
        delta: Delta<V>,
        invalidates: Vec<CacheKey>,
        write: BoxFuture<'static, Result<Option<V>, FetchError>>,
    ) -> Result<Option<V>, CacheError> {
        let runtime = current_runtime(key)?;

        // Try the delta once outside the lock; a panicking one never gets queued
        let current = self.peek(key).and_then(|snapshot| snapshot.value);
        if catch_unwind(AssertUnwindSafe(|| delta(current.as_ref()))).is_err() {
            warn!("💥 Optimistic delta for {} panicked, nothing applied", key);
            return Err(CacheError::FetchAborted {
                key: key.to_string(),
                reason: "optimistic delta panicked".to_string(),
            });
        }
        let now = Instant::now();

        let (id, snapshot) = self.inner.store.update(key, |entry| {
            entry.touch(now);
            let id = self.inner.next_mutation_id.fetch_add(1, Ordering::Relaxed) + 1;
            entry.push_optimistic(id, delta);
            (id, entry.snapshot())
        });
        debug!(
            "✨ OPTIMISTIC #{}: {} ({} pending)",
            id, key, snapshot.pending_mutations
        );
        self.notify(&snapshot);

        // The write runs on its own task so the delta is always settled,
        // even if the caller stops waiting.
        let mut guard = RollbackGuard {
            cache: self.clone(),
            key: key.clone(),
            id,
            armed: true,
        };
        let task = runtime.spawn(async move {
            let outcome = write.await;
            guard.armed = false;
            guard.cache.settle_mutation(&guard.key, guard.id, outcome, &invalidates)
        });

        task.await.unwrap_or_else(|join_error| {
            Err(CacheError::FetchAborted {
                key: key.to_string(),
                reason: join_error.to_string(),
            })
        })
    }

    fn settle_mutation(
        &self,
        key: &CacheKey,
        id: u64,
        outcome: Result<Option<V>, FetchError>,
        invalidates: &[CacheKey],
    ) -> Result<Option<V>, CacheError> {
        match outcome {
            Ok(server_value) => {
                let snapshot = self
                    .inner
                    .store
                    .update_existing(key, |entry| {
                        entry
                            .confirm(id, server_value.clone())
                            .then(|| entry.snapshot())
                    })
                    .flatten();
                self.inner.metrics.record_commit();
                info!("✅ MUTATION COMMIT #{}: {}", id, key);

                if let Some(snapshot) = snapshot {
                    self.notify(&snapshot);
                }
                for prefix in invalidates {
                    self.invalidate(prefix);
                }
                Ok(server_value)
            }
            Err(err) => {
                warn!("❌ MUTATION FAILED #{}: {}: {}", id, key, err);
                self.rollback_mutation(key, id);
                Err(match err {
                    FetchError::Conflict(reason) => CacheError::ConcurrentMutationConflict {
                        key: key.to_string(),
                        reason,
                    },
                    source => CacheError::WriteFailed {
                        key: key.to_string(),
                        source,
                    },
                })
            }
        }
    }

    fn rollback_mutation(&self, key: &CacheKey, id: u64) {
        let snapshot = self
            .inner
            .store
            .update_existing(key, |entry| entry.rollback(id).then(|| entry.snapshot()))
            .flatten();
        self.inner.metrics.record_rollback();

        match snapshot {
            Some(snapshot) => {
                warn!(
                    "↩️ MUTATION ROLLBACK #{}: {} ({} still pending)",
                    id, key, snapshot.pending_mutations
                );
                self.notify(&snapshot);
            }
            None => debug!("Mutation #{} on {} already gone (entry replaced)", id, key),
        }
    }
}
