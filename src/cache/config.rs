/**
 * Configuration constants and tunables for the synchronization cache
 */
use std::collections::HashMap;
use std::time::Duration;

/// Staleness threshold for resources without a class-specific override
pub const DEFAULT_STALE_TIME_SECS: u64 = 30;

/// Attempts per fetch before the failure is surfaced (first try included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff between fetch attempts, doubled on every retry
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Upper bound for the retry backoff
pub const DEFAULT_RETRY_MAX_DELAY_SECS: u64 = 30;

/// Per-attempt timeout for adapter reads
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;

/// Entries kept before idle ones are evicted, least recently accessed first
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Channel buffer size for refetch triggers
pub const TRIGGER_CHANNEL_CAPACITY: usize = 100;

/// Default staleness per resource class of the link-in-bio client (in seconds)
pub const DEFAULT_LINKS_STALE_SECS: u64 = 60;
pub const DEFAULT_NOTIFICATIONS_STALE_SECS: u64 = 0; // always revalidate
pub const DEFAULT_ADMIN_STALE_SECS: u64 = 300; // 5 minutes

/// Bounded retry with exponential backoff for transient fetch failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max_delay: Duration::from_secs(DEFAULT_RETRY_MAX_DELAY_SECS),
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1_u32 << exponent)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Tunables for a [`super::ResourceCache`].
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Staleness threshold when no per-resource override exists
    pub default_stale_time: Duration,
    /// Staleness thresholds keyed by resource name (key class)
    pub stale_times: HashMap<String, Duration>,
    pub retry: RetryPolicy,
    /// Per-attempt timeout for reads; `None` waits indefinitely
    pub fetch_timeout: Option<Duration>,
    pub max_entries: usize,
    /// Period of the `Interval` refetch trigger; `None` disables it
    pub refresh_interval: Option<Duration>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_stale_time: Duration::from_secs(DEFAULT_STALE_TIME_SECS),
            stale_times: HashMap::new(),
            retry: RetryPolicy::default(),
            fetch_timeout: Some(Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS)),
            max_entries: DEFAULT_MAX_ENTRIES,
            refresh_interval: None,
        }
    }
}

impl SyncConfig {
    #[must_use]
    pub fn with_default_stale_time(mut self, stale_time: Duration) -> Self {
        self.default_stale_time = stale_time;
        self
    }

    #[must_use]
    pub fn with_stale_time(mut self, resource: impl Into<String>, stale_time: Duration) -> Self {
        self.stale_times.insert(resource.into(), stale_time);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    #[must_use]
    pub const fn with_refresh_interval(mut self, interval: Option<Duration>) -> Self {
        self.refresh_interval = interval;
        self
    }

    #[must_use]
    pub fn stale_time_for(&self, resource: &str) -> Duration {
        self.stale_times
            .get(resource)
            .copied()
            .unwrap_or(self.default_stale_time)
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(DEFAULT_MAX_ATTEMPTS > 0, "DEFAULT_MAX_ATTEMPTS must be greater than 0");
    assert!(DEFAULT_RETRY_BASE_DELAY_MS > 0, "DEFAULT_RETRY_BASE_DELAY_MS must be greater than 0");
    assert!(
        DEFAULT_RETRY_MAX_DELAY_SECS > 0,
        "DEFAULT_RETRY_MAX_DELAY_SECS must be greater than 0"
    );
    assert!(DEFAULT_FETCH_TIMEOUT_SECS > 0, "DEFAULT_FETCH_TIMEOUT_SECS must be greater than 0");
    assert!(DEFAULT_MAX_ENTRIES > 0, "DEFAULT_MAX_ENTRIES must be greater than 0");
    assert!(TRIGGER_CHANNEL_CAPACITY > 0, "TRIGGER_CHANNEL_CAPACITY must be greater than 0");
};
