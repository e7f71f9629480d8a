use super::fetcher::FetchError;
use thiserror::Error;

/// Failures surfaced by the cache to its callers.
///
/// Cloneable so a single fetch outcome can be handed to every caller that
/// joined the same in-flight request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("fetch failed for {key} after {attempts} attempt(s): {source}")]
    FetchFailed {
        key: String,
        attempts: u32,
        #[source]
        source: FetchError,
    },

    #[error("write failed for {key}: {source}")]
    WriteFailed {
        key: String,
        #[source]
        source: FetchError,
    },

    #[error("no fetcher registered for {key}")]
    KeyNotFound { key: String },

    #[error("write for {key} conflicts with a competing mutation: {reason}")]
    ConcurrentMutationConflict { key: String, reason: String },

    #[error("operation on {key} was aborted: {reason}")]
    FetchAborted { key: String, reason: String },
}

impl CacheError {
    /// Key the failure belongs to, in display form.
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::FetchFailed { key, .. }
            | Self::WriteFailed { key, .. }
            | Self::KeyNotFound { key }
            | Self::ConcurrentMutationConflict { key, .. }
            | Self::FetchAborted { key, .. } => key,
        }
    }

    /// Whether a later `resolve` may succeed without any configuration change.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::FetchFailed { .. } | Self::FetchAborted { .. })
    }
}
