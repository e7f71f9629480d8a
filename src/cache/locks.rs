use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::warn;

/// Acquire a read guard, recovering the inner state if a prior panic poisoned the lock.
pub(crate) fn read<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockReadGuard<'a, T> {
    lock.read().unwrap_or_else(|poisoned| {
        warn!("⚠️  {what} lock poisoned by a prior panic, continuing with its last state");
        poisoned.into_inner()
    })
}

/// Acquire a write guard, recovering the inner state if a prior panic poisoned the lock.
pub(crate) fn write<'a, T>(lock: &'a RwLock<T>, what: &str) -> RwLockWriteGuard<'a, T> {
    lock.write().unwrap_or_else(|poisoned| {
        warn!("⚠️  {what} lock poisoned by a prior panic, continuing with its last state");
        poisoned.into_inner()
    })
}
