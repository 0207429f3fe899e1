//! In-process log store.
//!
//! Logs live in a `DashMap` keyed by log key. An expired log is dropped the
//! next time anyone touches it, and a background sweep drops the ones nobody
//! touches again. Blocked readers park on a shared `Notify` that every append
//! wakes.

use super::{Batch, EntryId, LogStore, Record, StoreError};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[derive(Debug, Default)]
struct MemoryLog {
    entries: Vec<(EntryId, Record)>,
    expires_at: Option<Instant>,
}

impl MemoryLog {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Thread-safe in-memory [`LogStore`].
#[derive(Clone, Debug, Default)]
pub struct MemoryLogStore {
    logs: Arc<DashMap<String, MemoryLog>>,
    appended: Arc<Notify>,
    next_seq: Arc<AtomicU64>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every log whose TTL has elapsed. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let before = self.logs.len();
        self.logs.retain(|_, log| !log.is_expired());
        before.saturating_sub(self.logs.len())
    }

    /// Run [`MemoryLogStore::purge_expired`] every `every` for as long as the
    /// runtime lives.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let dropped = store.purge_expired();
                if dropped > 0 {
                    debug!("Swept {} expired logs", dropped);
                }
            }
        })
    }

    /// Drop `key` if its TTL has elapsed. Returns `true` if a live log remains.
    fn purge_if_expired(&self, key: &str) -> bool {
        match self.logs.get(key) {
            Some(log) if !log.is_expired() => true,
            Some(log) => {
                drop(log);
                if self.logs.remove_if(key, |_, log| log.is_expired()).is_some() {
                    debug!("Expired log {} dropped", key);
                }
                false
            }
            None => false,
        }
    }

    fn entries_after(&self, key: &str, after: EntryId) -> Batch {
        if !self.purge_if_expired(key) {
            return Vec::new();
        }
        match self.logs.get(key) {
            Some(log) => {
                let start = log.entries.partition_point(|(id, _)| *id <= after);
                log.entries[start..].to_vec()
            }
            None => Vec::new(),
        }
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, key: &str, record: Record) -> Result<EntryId, StoreError> {
        let id = {
            let mut log = self.logs.entry(key.to_string()).or_default();
            if log.is_expired() {
                *log = MemoryLog::default();
            }
            // Allocate under the shard lock so ids and positions agree.
            let id = EntryId::new(0, self.next_seq.fetch_add(1, Ordering::Relaxed) + 1);
            log.entries.push((id, record));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn read_from(
        &self,
        key: &str,
        after: EntryId,
        block: Duration,
    ) -> Result<Batch, StoreError> {
        let deadline = tokio::time::Instant::now() + block;
        loop {
            // Register interest before looking so an append in between is not missed.
            let notified = self.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.entries_after(key, after);
            if !batch.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(self.entries_after(key, after));
            }
        }
    }

    async fn last(&self, key: &str) -> Result<Option<(EntryId, Record)>, StoreError> {
        if !self.purge_if_expired(key) {
            return Ok(None);
        }
        Ok(self
            .logs
            .get(key)
            .and_then(|log| log.entries.last().cloned()))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.purge_if_expired(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut log) = self.logs.get_mut(key) {
            log.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.logs.remove(key);
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}
