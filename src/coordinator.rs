//! Single-flight ingestion.
//!
//! Concurrent requests for an id serialise on a short lock window in which
//! exactly one of them sees the cache miss and starts production. The lease
//! is renewed for as long as that window lasts and released as soon as the
//! first chunk is stored, and every caller, including the one that triggered
//! production, then tails the same log.

use crate::cache::{Ingestion, StreamingCache, TailOutcome};
use crate::error::CacheError;
use crate::lock::{DistributedLock, LockGuard};
use crate::metrics;
use crate::producer::{ProduceOptions, Producer};
use crate::sink::ChunkSink;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct IngestionCoordinator {
    cache: StreamingCache,
    lock: Arc<dyn DistributedLock>,
    producer: Arc<dyn Producer>,
    options: ProduceOptions,
}

impl IngestionCoordinator {
    pub fn new(
        cache: StreamingCache,
        lock: Arc<dyn DistributedLock>,
        producer: Arc<dyn Producer>,
        options: ProduceOptions,
    ) -> Self {
        Self {
            cache,
            lock,
            producer,
            options,
        }
    }

    pub fn cache(&self) -> &StreamingCache {
        &self.cache
    }

    pub fn options(&self) -> &ProduceOptions {
        &self.options
    }

    pub async fn has(&self, id: &str) -> Result<bool, CacheError> {
        self.cache.has(id).await
    }

    pub async fn get_length(&self, id: &str) -> Result<Option<u64>, CacheError> {
        self.cache.get_length(id).await
    }

    /// Under the id's lock, start production if the cache has no log for it.
    ///
    /// Returns the ingestion handle when this call started production.
    async fn ensure_ingested(&self, id: &str) -> Result<Option<Ingestion>, CacheError> {
        let guard = LockGuard::acquire(Arc::clone(&self.lock), &self.cache.lock_key(id)).await?;
        debug!("Acquired lock {} for {}", guard.key(), id);

        let decision = guard.hold_while(self.produce_if_missing(id)).await;

        if let Err(e) = guard.release().await {
            warn!("Failed to release lock for {}: {}; lease will expire", id, e);
        } else {
            debug!("Released lock for {}", id);
        }
        decision
    }

    async fn produce_if_missing(&self, id: &str) -> Result<Option<Ingestion>, CacheError> {
        let cached = self.cache.has(id).await?;
        metrics::record_cache_lookup(cached);
        if cached {
            debug!("{} is cached or already being produced", id);
            return Ok(None);
        }

        info!("{} is not cached; starting production", id);
        let ingestion = self
            .cache
            .ingest(id, Arc::clone(&self.producer), self.options.clone())
            .await?;
        Ok(Some(ingestion))
    }

    /// Stream `id` into `sink`, producing it first if nobody has.
    ///
    /// If this call started production and production fails while the tail is
    /// running, the production error is returned. A tail that gives up returns
    /// right away; production carries on in the background.
    pub async fn stream_to(&self, id: &str, sink: ChunkSink) -> Result<TailOutcome, CacheError> {
        let Some(ingestion) = self.ensure_ingested(id).await? else {
            return self.cache.tail(id, sink).await;
        };

        let tail = self.cache.tail(id, sink);
        let finished = ingestion.finished();
        tokio::pin!(tail, finished);

        tokio::select! {
            outcome = &mut tail => {
                let outcome = outcome?;
                // The sentinel is appended before production reports back.
                if outcome.is_complete() {
                    finished.await?;
                }
                Ok(outcome)
            }
            produced = &mut finished => {
                let total = produced?;
                debug!("Production of {} done ({} bytes); finishing tail", id, total);
                tail.await
            }
        }
    }

    /// Make sure `id` is cached or being produced, without tailing it.
    ///
    /// Returns `true` if this call started production.
    pub async fn warm(&self, id: &str) -> Result<bool, CacheError> {
        Ok(self.ensure_ingested(id).await?.is_some())
    }

    /// Wait up to `grace` for productions still running.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.cache.shutdown(grace).await
    }
}
