//! Lease-based mutual exclusion keyed by string.
//!
//! A holder acquires a [`LockHandle`] and must release it; if the holder
//! crashes the lease runs out and the key frees itself. [`LockGuard`] wraps a
//! handle so release happens on every exit path.

pub mod memory;
#[cfg(feature = "valkey")]
pub mod valkey;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

pub use memory::MemoryLock;
#[cfg(feature = "valkey")]
pub use valkey::ValkeyLock;

#[derive(Debug, Error)]
pub enum LockError {
    #[cfg(feature = "valkey")]
    #[error("Valkey lock command failed: {0}")]
    Valkey(#[from] redis::RedisError),

    #[error("Timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: String, waited: Duration },
}

/// Lease timing shared by all lock backends.
#[derive(Clone, Debug)]
pub struct LockConfig {
    /// How long a lease lives if its holder never releases it.
    pub lease: Duration,
    /// Upper bound on a blocking acquire.
    pub acquire_timeout: Duration,
    /// Pause between acquisition attempts while the key is held.
    pub retry_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            lease: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(60),
            retry_interval: Duration::from_millis(50),
        }
    }
}

/// Proof of ownership of one lock key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: String,
}

impl LockHandle {
    pub(crate) fn issue(key: &str) -> Self {
        Self {
            key: key.to_string(),
            token: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Block until `key` is free, then take it.
    async fn acquire(&self, key: &str) -> Result<LockHandle, LockError>;

    /// Give the key back. Releasing a lease that already expired (and may have
    /// been taken by someone else) is a no-op.
    async fn release(&self, handle: LockHandle) -> Result<(), LockError>;

    /// Push the lease of a held key a full lease period into the future.
    /// Returns `false` if the handle no longer owns the key.
    async fn extend(&self, handle: &LockHandle) -> Result<bool, LockError>;

    /// Lease period granted by `acquire` and `extend`.
    fn lease(&self) -> Duration;
}

/// Scoped ownership of a lock key.
///
/// Call [`LockGuard::release`] on the normal path. A guard dropped without
/// release (early return, panic, cancelled future) releases in a spawned task.
pub struct LockGuard {
    lock: Arc<dyn DistributedLock>,
    handle: Option<LockHandle>,
}

impl LockGuard {
    pub async fn acquire(lock: Arc<dyn DistributedLock>, key: &str) -> Result<Self, LockError> {
        let handle = lock.acquire(key).await?;
        Ok(Self {
            lock,
            handle: Some(handle),
        })
    }

    pub fn key(&self) -> &str {
        self.handle.as_ref().map(|h| h.key.as_str()).unwrap_or_default()
    }

    /// Run `work` while holding the key, renewing the lease every third of
    /// its period so a slow `work` cannot outlive it.
    pub async fn hold_while<F: Future>(&self, work: F) -> F::Output {
        let Some(handle) = self.handle.as_ref() else {
            return work.await;
        };
        let period = (self.lock.lease() / 3).max(Duration::from_millis(1));
        let mut renew = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = renew.tick() => match self.lock.extend(handle).await {
                    Ok(true) => debug!("Renewed lock {}", handle.key),
                    Ok(false) => warn!("Lock {} was lost before it could be renewed", handle.key),
                    Err(e) => warn!("Failed to renew lock {}: {}", handle.key, e),
                },
            }
        }
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        match self.handle.take() {
            Some(handle) => self.lock.release(handle).await,
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let lock = Arc::clone(&self.lock);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = lock.release(handle).await {
                        warn!("Deferred lock release failed: {}", e);
                    }
                });
            }
            Err(_) => warn!(
                "Lock {} dropped outside a runtime; waiting for lease expiry",
                handle.key
            ),
        }
    }
}
