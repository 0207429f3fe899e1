//! Streaming cache with a single writer and many concurrent tailers.
//!
//! Every resource id maps to one append-only log in the [`LogStore`]. A
//! producer's output is appended chunk by chunk while readers tail the same
//! log from its first entry. A sentinel entry marks the end of production so
//! readers that attach at any time, even after production finished, can tell
//! a complete log from one that is still growing.

use crate::error::CacheError;
use crate::metrics;
use crate::producer::{ProduceOptions, Producer};
use crate::sink::ChunkSink;
use crate::store::{EntryId, LogStore, Record};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Payload of the end-of-stream sentinel.
pub const SENTINEL_BYTE: u8 = 0x00;

/// Metadata marking a record as the sentinel. A data chunk that happens to be
/// the single byte `0x00` never carries it.
const EOS_FIELD: &str = "eos";
const LENGTH_FIELD: &str = "length";
/// Tags every record with the production that wrote it, so a tail never
/// splices a failed production onto the retry that replaced it.
const GENERATION_FIELD: &str = "gen";

/// Chunks buffered between a producer and the appender.
const INGEST_BUFFER: usize = 32;

/// What resets the empty-poll counter of a tail.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PollReset {
    /// Any entry, including a lone sentinel.
    #[default]
    AnyEntry,
    /// Only entries carrying data.
    DataEntry,
}

/// Tuning for the log protocol.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// TTL applied to a log once production succeeds.
    pub retention: Duration,
    /// How long each tail poll blocks waiting for new entries.
    pub poll_timeout: Duration,
    /// Consecutive empty polls a tail tolerates before giving up.
    pub max_empty_polls: u32,
    pub poll_reset: PollReset,
    /// Namespace for every key the cache creates.
    pub key_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            retention: Duration::from_secs(4 * 3600),
            poll_timeout: Duration::from_millis(100),
            max_empty_polls: 10,
            poll_reset: PollReset::AnyEntry,
            key_prefix: "tailcast".to_string(),
        }
    }
}

/// How a tail ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TailOutcome {
    /// The sentinel was reached; the consumer has every byte.
    Complete { bytes: u64 },
    /// Too many empty polls; the consumer may hold a truncated stream.
    Abandoned { bytes: u64 },
    /// The consumer closed its end first.
    Disconnected { bytes: u64 },
}

impl TailOutcome {
    pub fn bytes(&self) -> u64 {
        match *self {
            TailOutcome::Complete { bytes }
            | TailOutcome::Abandoned { bytes }
            | TailOutcome::Disconnected { bytes } => bytes,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, TailOutcome::Complete { .. })
    }

    fn label(&self) -> &'static str {
        match self {
            TailOutcome::Complete { .. } => "complete",
            TailOutcome::Abandoned { .. } => "abandoned",
            TailOutcome::Disconnected { .. } => "disconnected",
        }
    }
}

fn sentinel(total: u64, generation: &str) -> Record {
    Record::new(Bytes::from_static(&[SENTINEL_BYTE]))
        .with_meta(GENERATION_FIELD, generation)
        .with_meta(EOS_FIELD, "1")
        .with_meta(LENGTH_FIELD, total.to_string())
}

fn is_sentinel(record: &Record) -> bool {
    record.payload.as_ref() == &[SENTINEL_BYTE] && record.meta(EOS_FIELD) == Some("1")
}

fn sentinel_length(record: &Record) -> Option<u64> {
    if !is_sentinel(record) {
        return None;
    }
    record.meta(LENGTH_FIELD).and_then(|v| v.parse().ok())
}

/// A production that has started writing into the cache.
///
/// Dropping this handle does not stop production.
#[derive(Debug)]
pub struct Ingestion {
    id: String,
    outcome: oneshot::Receiver<Result<u64, String>>,
}

impl Ingestion {
    /// Wait for production to end. Returns the number of bytes produced.
    pub async fn finished(self) -> Result<u64, CacheError> {
        match self.outcome.await {
            Ok(Ok(total)) => Ok(total),
            Ok(Err(reason)) => Err(CacheError::Production {
                id: self.id,
                reason,
            }),
            Err(_) => Err(CacheError::Production {
                id: self.id,
                reason: "ingestion worker stopped unexpectedly".to_string(),
            }),
        }
    }
}

#[derive(Clone)]
pub struct StreamingCache {
    store: Arc<dyn LogStore>,
    config: Arc<CacheConfig>,
    tasks: TaskTracker,
}

impl StreamingCache {
    pub fn new(store: Arc<dyn LogStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            tasks: TaskTracker::new(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    pub fn stream_key(&self, id: &str) -> String {
        format!("{}:stream:{}", self.config.key_prefix, id)
    }

    pub fn lock_key(&self, id: &str) -> String {
        format!("{}:lock:{}", self.config.key_prefix, id)
    }

    /// Whether a log exists for `id`, complete or still being produced.
    pub async fn has(&self, id: &str) -> Result<bool, CacheError> {
        Ok(self.store.exists(&self.stream_key(id)).await?)
    }

    /// Start producing `id` into its log.
    ///
    /// Returns once the first chunk is stored or production ends, whichever
    /// comes first, so tailers can attach while production continues in the
    /// background. A failure observed before that point is returned as a
    /// production error; later failures are reported by
    /// [`Ingestion::finished`]. Either way the log is deleted.
    ///
    /// Refused once [`StreamingCache::shutdown`] has been called.
    pub async fn ingest(
        &self,
        id: &str,
        producer: Arc<dyn Producer>,
        options: ProduceOptions,
    ) -> Result<Ingestion, CacheError> {
        if self.tasks.is_closed() {
            return Err(CacheError::ShuttingDown);
        }
        let key = self.stream_key(id);
        let generation = uuid::Uuid::new_v4().to_string();
        let (sink, mut chunks) = ChunkSink::channel(INGEST_BUFFER);
        let (started_tx, started_rx) = oneshot::channel::<Result<(), String>>();
        let (outcome_tx, outcome_rx) = oneshot::channel();

        info!("Starting production of {} into {}", id, key);
        metrics::record_production_started();

        let produce_id = id.to_string();
        let production =
            self.tasks
                .spawn(async move { producer.produce(&produce_id, sink, &options).await });

        let store = Arc::clone(&self.store);
        let retention = self.config.retention;
        let id_owned = id.to_string();
        self.tasks.spawn(async move {
            let mut started = Some(started_tx);
            let mut total: u64 = 0;

            while let Some(chunk) = chunks.recv().await {
                if chunk.is_empty() {
                    continue;
                }
                let len = chunk.len() as u64;
                let record = Record::new(chunk).with_meta(GENERATION_FIELD, generation.as_str());
                // One lost chunk does not abort an otherwise healthy production.
                if let Err(e) = store.append(&key, record).await {
                    metrics::record_append_error();
                    error!("Failed to append chunk to {}: {}", key, e);
                    continue;
                }
                total += len;
                // The log must exist before the lock holder lets anyone else look.
                if let Some(tx) = started.take() {
                    let _ = tx.send(Ok(()));
                }
            }

            let result = match production.await {
                Ok(Ok(())) => Ok(total),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(format!("producer task failed: {e}")),
            };

            match &result {
                Ok(total) => {
                    if let Err(e) = store.append(&key, sentinel(*total, &generation)).await {
                        error!("Failed to append end-of-stream marker to {}: {}", key, e);
                    }
                    if let Err(e) = store.expire(&key, retention).await {
                        error!("Failed to set expiry on {}: {}", key, e);
                    }
                    metrics::record_produced_bytes(*total);
                    info!("Production of {} finished: {} bytes", id_owned, total);
                }
                Err(reason) => {
                    metrics::record_production_failed();
                    error!("Production of {} failed: {}", id_owned, reason);
                    if let Err(e) = store.delete(&key).await {
                        error!("Failed to delete partial log {}: {}", key, e);
                    }
                }
            }

            if let Some(tx) = started.take() {
                let _ = tx.send(result.clone().map(|_| ()));
            }
            let _ = outcome_tx.send(result);
        });

        match started_rx.await {
            Ok(Ok(())) => Ok(Ingestion {
                id: id.to_string(),
                outcome: outcome_rx,
            }),
            Ok(Err(reason)) => Err(CacheError::Production {
                id: id.to_string(),
                reason,
            }),
            Err(_) => Err(CacheError::Production {
                id: id.to_string(),
                reason: "ingestion worker stopped before producing output".to_string(),
            }),
        }
    }

    /// Copy the log for `id` into `sink` from its first entry, following it
    /// as it grows, until the sentinel, abandonment, or consumer disconnect.
    ///
    /// The sink is closed when this returns. The sentinel is never forwarded.
    pub async fn tail(&self, id: &str, sink: ChunkSink) -> Result<TailOutcome, CacheError> {
        let key = self.stream_key(id);
        let mut cursor = EntryId::ZERO;
        let mut empty_polls: u32 = 0;
        let mut delivered: u64 = 0;
        let mut generation: Option<String> = None;

        let outcome = 'poll: loop {
            if sink.is_closed() {
                break TailOutcome::Disconnected { bytes: delivered };
            }

            let batch = self
                .store
                .read_from(&key, cursor, self.config.poll_timeout)
                .await?;

            let Some((last_id, last)) = batch.last() else {
                empty_polls += 1;
                if empty_polls > self.config.max_empty_polls {
                    warn!(
                        "No end of stream on {} after {} empty polls; abandoning tail at {} bytes",
                        key, self.config.max_empty_polls, delivered
                    );
                    break TailOutcome::Abandoned { bytes: delivered };
                }
                continue;
            };
            cursor = *last_id;
            let finished = is_sentinel(last);

            let mut saw_data = false;
            for (_, record) in batch {
                let tag = record.meta(GENERATION_FIELD).unwrap_or_default();
                if generation.get_or_insert_with(|| tag.to_string()).as_str() != tag {
                    warn!(
                        "Log {} was replaced by another production; abandoning tail at {} bytes",
                        key, delivered
                    );
                    break 'poll TailOutcome::Abandoned { bytes: delivered };
                }
                if is_sentinel(&record) {
                    continue;
                }
                saw_data = true;
                let len = record.payload.len() as u64;
                if sink.write(record.payload).await.is_err() {
                    debug!("Consumer of {} went away after {} bytes", key, delivered);
                    break 'poll TailOutcome::Disconnected { bytes: delivered };
                }
                delivered += len;
            }

            if finished {
                break TailOutcome::Complete { bytes: delivered };
            }
            if saw_data || self.config.poll_reset == PollReset::AnyEntry {
                empty_polls = 0;
            }
        };

        metrics::record_tail(outcome.label());
        drop(sink);
        Ok(outcome)
    }

    /// Total length of `id` if its production has completed.
    pub async fn get_length(&self, id: &str) -> Result<Option<u64>, CacheError> {
        let last = self.store.last(&self.stream_key(id)).await?;
        Ok(last.and_then(|(_, record)| sentinel_length(&record)))
    }

    /// Refuse new productions and wait up to `grace` for running ones.
    /// Returns `true` if every production finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.tasks.close();
        tokio::time::timeout(grace, self.tasks.wait()).await.is_ok()
    }
}
