use super::errors::CacheError;
use super::key::CacheKey;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, Shared};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Empty,
    Fetching,
    Fresh,
    Stale,
    Failed,
}

/// Status of an entry with no fetch in flight. `Fetching` is derived from
/// the in-flight handle instead of stored, so the two can never disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settled {
    Empty,
    Fresh,
    Stale,
    Failed,
}

pub(crate) type SharedFetch<V> = Shared<BoxFuture<'static, Result<V, CacheError>>>;

pub(crate) type Delta<V> = Arc<dyn Fn(Option<&V>) -> V + Send + Sync>;

#[derive(Clone)]
pub(crate) struct InFlight<V> {
    pub id: u64,
    pub future: SharedFetch<V>,
    /// Confirmations the entry had seen when the fetch was issued
    issued_after: u64,
}

#[derive(Clone)]
enum MutationState<V> {
    Pending,
    /// Acknowledged by the server (`seq`-th confirmation on this entry),
    /// optionally with the resource it returned.
    Confirmed { seq: u64, server: Option<V> },
}

/// A confirmed delta folded into the base while a fetch was in flight.
/// Replayed over the fetch result if the fetch was issued before it.
#[derive(Clone)]
struct Folded<V> {
    seq: u64,
    delta: Delta<V>,
    server: Option<V>,
}

#[derive(Clone)]
struct PendingMutation<V> {
    id: u64,
    delta: Delta<V>,
    state: MutationState<V>,
}

impl<V> PendingMutation<V> {
    const fn is_confirmed(&self) -> bool {
        matches!(self.state, MutationState::Confirmed { .. })
    }

    const fn confirmed_seq(&self) -> Option<u64> {
        match self.state {
            MutationState::Confirmed { seq, .. } => Some(seq),
            MutationState::Pending => None,
        }
    }
}

/// Run a caller-supplied delta. A panicking delta is skipped so the entry
/// stays usable.
fn run_delta<V>(delta: &Delta<V>, current: Option<&V>) -> Option<V> {
    catch_unwind(AssertUnwindSafe(|| delta(current)))
        .inspect_err(|_| warn!("⚠️  Optimistic delta panicked, skipping it"))
        .ok()
}

/// One cached resource: the confirmed server value, its optimistic
/// projection, and the bookkeeping needed to refetch and reconcile it.
#[derive(Clone)]
pub struct CacheEntry<V> {
    key: CacheKey,
    /// Last value known to match the server, before pending deltas
    confirmed: Option<V>,
    /// `confirmed` with every queued delta applied in issuance order
    value: Option<V>,
    settled: Settled,
    in_flight: Option<InFlight<V>>,
    /// The entry was invalidated while `in_flight` was running
    invalidated_in_flight: bool,
    fetched_at: Option<DateTime<Utc>>,
    refreshed_at: Option<Instant>,
    error: Option<CacheError>,
    pending: VecDeque<PendingMutation<V>>,
    folded_in_flight: Vec<Folded<V>>,
    confirmations: u64,
    version: u64,
    last_accessed: Instant,
}

impl<V: Clone> CacheEntry<V> {
    #[must_use]
    pub fn new(key: CacheKey) -> Self {
        Self {
            key,
            confirmed: None,
            value: None,
            settled: Settled::Empty,
            in_flight: None,
            invalidated_in_flight: false,
            fetched_at: None,
            refreshed_at: None,
            error: None,
            pending: VecDeque::new(),
            folded_in_flight: Vec::new(),
            confirmations: 0,
            version: 0,
            last_accessed: Instant::now(),
        }
    }

    /// An entry holding a value that was just confirmed by the server.
    #[must_use]
    pub fn fresh(key: CacheKey, value: V) -> Self {
        let mut entry = Self::new(key);
        entry.set_confirmed(value, Instant::now());
        entry
    }

    #[must_use]
    pub const fn key(&self) -> &CacheKey {
        &self.key
    }

    #[must_use]
    pub const fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }

    #[must_use]
    pub const fn status(&self) -> FetchStatus {
        if self.in_flight.is_some() {
            return FetchStatus::Fetching;
        }
        match self.settled {
            Settled::Empty => FetchStatus::Empty,
            Settled::Fresh => FetchStatus::Fresh,
            Settled::Stale => FetchStatus::Stale,
            Settled::Failed => FetchStatus::Failed,
        }
    }

    #[must_use]
    pub const fn fetched_at(&self) -> Option<DateTime<Utc>> {
        self.fetched_at
    }

    #[must_use]
    pub const fn error(&self) -> Option<&CacheError> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn pending_mutations(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub const fn last_accessed(&self) -> Instant {
        self.last_accessed
    }

    /// Nothing in flight and nothing awaiting confirmation.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending.is_empty()
    }

    /// Whether the entry needs a refetch under `stale_time`.
    ///
    /// Only a `Fresh` entry can be within its threshold; a zero threshold
    /// makes every entry stale.
    #[must_use]
    pub fn is_stale(&self, stale_time: Duration, now: Instant) -> bool {
        match (self.settled, self.refreshed_at) {
            (Settled::Fresh, Some(at)) => now.saturating_duration_since(at) >= stale_time,
            _ => true,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> EntrySnapshot<V> {
        EntrySnapshot {
            key: self.key.clone(),
            value: self.value.clone(),
            status: self.status(),
            fetched_at: self.fetched_at,
            error: self.error.clone(),
            pending_mutations: self.pending.len(),
            version: self.version,
        }
    }

    pub(crate) const fn touch(&mut self, now: Instant) {
        self.last_accessed = now;
    }

    pub(crate) const fn in_flight(&self) -> Option<&InFlight<V>> {
        self.in_flight.as_ref()
    }

    pub(crate) fn begin_fetch(&mut self, id: u64, future: SharedFetch<V>) {
        self.in_flight = Some(InFlight {
            id,
            future,
            issued_after: self.confirmations,
        });
        self.version += 1;
    }

    /// Apply a successful read if `fetch_id` is still the registered fetch.
    ///
    /// The read reflects every write confirmed before it was issued. Writes
    /// confirmed while it ran are replayed on top of it, as are deltas still
    /// awaiting confirmation. A read that outlived an invalidation lands
    /// stale.
    pub(crate) fn finish_fetch(&mut self, fetch_id: u64, value: V, now: Instant) -> bool {
        let Some(in_flight) = self.in_flight.take_if(|f| f.id == fetch_id) else {
            return false;
        };
        let issued_after = in_flight.issued_after;

        let mut base = value;
        for folded in self.folded_in_flight.drain(..) {
            if folded.seq > issued_after {
                base = match folded.server {
                    Some(server) => server,
                    None => run_delta(&folded.delta, Some(&base)).unwrap_or(base),
                };
            }
        }
        self.pending
            .retain(|m| m.confirmed_seq().is_none_or(|seq| seq > issued_after));
        self.set_confirmed(base, now);

        if std::mem::take(&mut self.invalidated_in_flight) {
            self.settled = Settled::Stale;
        }
        true
    }

    /// Record a failed read, keeping the previous value displayable.
    pub(crate) fn fail_fetch(&mut self, fetch_id: u64, error: CacheError) -> bool {
        if self.in_flight.take_if(|f| f.id == fetch_id).is_none() {
            return false;
        }
        self.folded_in_flight.clear();
        self.invalidated_in_flight = false;
        self.settled = Settled::Failed;
        self.error = Some(error);
        self.version += 1;
        true
    }

    pub(crate) fn set_confirmed(&mut self, value: V, now: Instant) {
        self.confirmed = Some(value);
        self.settled = Settled::Fresh;
        self.fetched_at = Some(Utc::now());
        self.refreshed_at = Some(now);
        self.error = None;
        self.recompute();
        self.version += 1;
    }

    /// Drop the value and every optimistic delta while keeping an in-flight
    /// fetch registered, so later reads join it instead of starting another.
    /// Returns false when nothing is in flight and the entry can simply go.
    pub(crate) fn invalidate(&mut self) -> bool {
        if self.in_flight.is_none() {
            return false;
        }
        self.confirmed = None;
        self.value = None;
        self.settled = Settled::Empty;
        self.fetched_at = None;
        self.refreshed_at = None;
        self.error = None;
        self.pending.clear();
        self.folded_in_flight.clear();
        self.invalidated_in_flight = true;
        self.version += 1;
        true
    }

    pub(crate) fn mark_stale(&mut self) -> bool {
        if self.settled == Settled::Fresh {
            self.settled = Settled::Stale;
            self.version += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn push_optimistic(&mut self, id: u64, delta: Delta<V>) {
        self.pending.push_back(PendingMutation {
            id,
            delta,
            state: MutationState::Pending,
        });
        self.recompute();
        self.version += 1;
    }

    /// Mark mutation `id` as acknowledged. Confirmed deltas fold into the
    /// confirmed value only once every earlier delta has settled, so the
    /// projection keeps issuance order.
    pub(crate) fn confirm(&mut self, id: u64, server_value: Option<V>) -> bool {
        let Some(mutation) = self.pending.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        self.confirmations += 1;
        mutation.state = MutationState::Confirmed {
            seq: self.confirmations,
            server: server_value,
        };
        self.fold_confirmed();
        self.recompute();
        self.version += 1;
        true
    }

    /// Drop mutation `id` and replay the remaining deltas over the confirmed value.
    pub(crate) fn rollback(&mut self, id: u64) -> bool {
        let Some(position) = self.pending.iter().position(|m| m.id == id) else {
            return false;
        };
        self.pending.remove(position);
        self.fold_confirmed();
        self.recompute();
        self.version += 1;
        true
    }

    fn fold_confirmed(&mut self) {
        while self.pending.front().is_some_and(PendingMutation::is_confirmed) {
            let Some(done) = self.pending.pop_front() else {
                break;
            };
            let MutationState::Confirmed { seq, server } = done.state else {
                continue;
            };
            self.confirmed = match &server {
                Some(server) => Some(server.clone()),
                None => run_delta(&done.delta, self.confirmed.as_ref()).or(self.confirmed.take()),
            };
            if self.in_flight.is_some() {
                self.folded_in_flight.push(Folded {
                    seq,
                    delta: done.delta,
                    server,
                });
            }
        }
    }

    fn recompute(&mut self) {
        let mut projected = self.confirmed.clone();
        for mutation in &self.pending {
            if let Some(next) = run_delta(&mutation.delta, projected.as_ref()) {
                projected = Some(next);
            }
        }
        self.value = projected;
    }
}

impl<V> fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("settled", &self.settled)
            .field("fetching", &self.in_flight.is_some())
            .field("has_value", &self.value.is_some())
            .field("pending", &self.pending.len())
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

/// Immutable view of an entry as delivered to observers.
///
/// `version` increases with every change during the entry's lifetime;
/// a removed and recreated entry starts over.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot<V> {
    pub key: CacheKey,
    pub value: Option<V>,
    pub status: FetchStatus,
    pub fetched_at: Option<DateTime<Utc>>,
    pub error: Option<CacheError>,
    pub pending_mutations: usize,
    pub version: u64,
}

impl<V> EntrySnapshot<V> {
    /// Snapshot of a key with no entry, sent when an entry is invalidated.
    #[must_use]
    pub const fn empty(key: CacheKey) -> Self {
        Self {
            key,
            value: None,
            status: FetchStatus::Empty,
            fetched_at: None,
            error: None,
            pending_mutations: 0,
            version: 0,
        }
    }
}
