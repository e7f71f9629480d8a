pub mod config;
pub mod engine;
pub mod entry;
pub mod errors;
pub mod fetcher;
pub mod key;
mod locks;
pub mod metrics;
pub mod mutation;
pub mod store;
pub mod subscription;
pub mod triggers;

pub use config::{RetryPolicy, SyncConfig};
pub use engine::{Origin, ResolveOptions, Resolved, ResourceCache};
pub use entry::{CacheEntry, EntrySnapshot, FetchStatus};
pub use errors::CacheError;
pub use fetcher::{FetchError, Fetcher, FetcherRegistry, SharedFetcher};
pub use key::{CacheKey, KeyParam};
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use mutation::Mutation;
pub use store::{CacheStats, CacheStore};
pub use subscription::{Observer, SubscriptionHandle, SubscriptionManager};
pub use triggers::{RefetchTrigger, TriggerListener};
