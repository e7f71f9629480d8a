use super::config::TRIGGER_CHANNEL_CAPACITY;
use super::engine::ResourceCache;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Reasons for re-evaluating cached keys. Every trigger goes through the
/// same in-flight check, so none of them can start a duplicate fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefetchTrigger {
    /// Plain read access
    Access,
    /// Explicit refetch request, ignores staleness
    Forced,
    /// Entry was invalidated or marked stale
    Invalidation,
    /// A subscriber attached to the key
    SubscriberAttached,
    /// The fetcher's transport came back
    Reconnected,
    /// The app regained foreground/active context
    Foregrounded,
    /// Periodic refresh
    Interval,
}

impl RefetchTrigger {
    #[must_use]
    pub const fn bypasses_staleness(self) -> bool {
        matches!(self, Self::Forced | Self::Invalidation)
    }
}

impl fmt::Display for RefetchTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Access => "access",
            Self::Forced => "forced",
            Self::Invalidation => "invalidation",
            Self::SubscriberAttached => "subscriber-attached",
            Self::Reconnected => "reconnected",
            Self::Foregrounded => "foregrounded",
            Self::Interval => "interval",
        };
        f.write_str(name)
    }
}

/// Background task feeding external triggers (reconnect, foreground,
/// periodic refresh) into a [`ResourceCache`].
#[derive(Debug)]
pub struct TriggerListener {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl TriggerListener {
    /// Bounded channel to feed a listener with.
    #[must_use]
    pub fn channel() -> (mpsc::Sender<RefetchTrigger>, mpsc::Receiver<RefetchTrigger>) {
        mpsc::channel(TRIGGER_CHANNEL_CAPACITY)
    }

    /// Start listening. Stops when `cancel` fires or every sender is gone.
    /// Fires [`RefetchTrigger::Interval`] when the cache has a refresh
    /// interval configured.
    pub fn spawn<V, P>(
        cache: ResourceCache<V, P>,
        triggers: mpsc::Receiver<RefetchTrigger>,
        cancel: CancellationToken,
    ) -> Self
    where
        V: Clone + Send + Sync + 'static,
        P: Send + 'static,
    {
        let interval = cache.config().refresh_interval.map(refresh_timer);
        let task = tokio::spawn(run_listener(cache, triggers, interval, cancel.clone()));
        Self { cancel, task }
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the listener and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Trigger listener ended abnormally: {}", e);
        }
    }
}

fn refresh_timer(period: Duration) -> Interval {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn run_listener<V, P>(
    cache: ResourceCache<V, P>,
    mut triggers: mpsc::Receiver<RefetchTrigger>,
    mut interval: Option<Interval>,
    cancel: CancellationToken,
) where
    V: Clone + Send + Sync + 'static,
    P: Send + 'static,
{
    info!("👂 Trigger listener started");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("🛑 Trigger listener shutting down");
                break;
            }
            received = triggers.recv() => {
                let Some(trigger) = received else {
                    debug!("Trigger channel closed");
                    break;
                };
                cache.trigger(trigger);
            }
            () = next_tick(&mut interval) => {
                cache.trigger(RefetchTrigger::Interval);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staleness_bypass() {
        assert!(RefetchTrigger::Forced.bypasses_staleness());
        assert!(RefetchTrigger::Invalidation.bypasses_staleness());
        assert!(!RefetchTrigger::Reconnected.bypasses_staleness());
        assert!(!RefetchTrigger::Foregrounded.bypasses_staleness());
        assert_eq!(RefetchTrigger::SubscriberAttached.to_string(), "subscriber-attached");
    }
}
