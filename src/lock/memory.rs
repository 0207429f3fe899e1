//! In-process lease lock for single-instance deployments and tests.

use super::{DistributedLock, LockConfig, LockError, LockHandle};
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, warn};

#[derive(Debug)]
struct Lease {
    token: String,
    expires_at: Instant,
}

/// [`DistributedLock`] backed by a `DashMap` of leases.
#[derive(Clone, Debug)]
pub struct MemoryLock {
    leases: Arc<DashMap<String, Lease>>,
    released: Arc<Notify>,
    config: LockConfig,
}

impl MemoryLock {
    pub fn new(config: LockConfig) -> Self {
        Self {
            leases: Arc::new(DashMap::new()),
            released: Arc::new(Notify::new()),
            config,
        }
    }

    fn try_take(&self, key: &str) -> Option<LockHandle> {
        let now = Instant::now();
        let lease = |handle: &LockHandle| Lease {
            token: handle.token.clone(),
            expires_at: now + self.config.lease,
        };
        match self.leases.entry(key.to_string()) {
            Entry::Vacant(slot) => {
                let handle = LockHandle::issue(key);
                slot.insert(lease(&handle));
                Some(handle)
            }
            Entry::Occupied(mut slot) if slot.get().expires_at <= now => {
                warn!("Lease on {} expired without release; taking over", key);
                let handle = LockHandle::issue(key);
                slot.insert(lease(&handle));
                Some(handle)
            }
            Entry::Occupied(_) => None,
        }
    }
}

impl Default for MemoryLock {
    fn default() -> Self {
        Self::new(LockConfig::default())
    }
}

#[async_trait]
impl DistributedLock for MemoryLock {
    async fn acquire(&self, key: &str) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(handle) = self.try_take(key) {
                debug!("Acquired lock {}", key);
                return Ok(handle);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: started.elapsed(),
                });
            }
            // Wake on release, or re-check periodically to notice expired leases.
            let wait = self.config.retry_interval.min(deadline - now);
            let _ = tokio::time::timeout(wait, notified).await;
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let removed = self
            .leases
            .remove_if(&handle.key, |_, lease| lease.token == handle.token);
        if removed.is_some() {
            debug!("Released lock {}", handle.key);
            self.released.notify_waiters();
        } else {
            warn!("Lock {} was no longer held by this handle", handle.key);
        }
        Ok(())
    }

    async fn extend(&self, handle: &LockHandle) -> Result<bool, LockError> {
        match self.leases.get_mut(&handle.key) {
            Some(mut lease) if lease.token == handle.token => {
                lease.expires_at = Instant::now() + self.config.lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn lease(&self) -> Duration {
        self.config.lease
    }
}
