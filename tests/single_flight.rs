//! Single-flight properties of the ingestion coordinator.
//!
//! Uses the in-memory log store and lock with short poll timeouts; the
//! producer counts how often it runs.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tailcast::cache::{CacheConfig, StreamingCache, TailOutcome};
use tailcast::coordinator::IngestionCoordinator;
use tailcast::error::CacheError;
use tailcast::lock::{LockConfig, MemoryLock};
use tailcast::producer::{ProduceError, ProduceOptions, Producer};
use tailcast::sink::ChunkSink;
use tailcast::store::MemoryLogStore;
use tokio::sync::mpsc;

// ── Test producer ─────────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
enum Failure {
    Never,
    /// The first call fails before writing anything.
    FirstCallUpfront,
    /// Every call fails after its first chunk.
    AfterFirstChunk,
}

struct CountingProducer {
    chunks: Vec<&'static [u8]>,
    /// Wait before the first chunk, like a slow origin.
    warmup: Duration,
    pause: Duration,
    failure: Failure,
    calls: AtomicUsize,
}

impl CountingProducer {
    fn new(chunks: Vec<&'static [u8]>) -> Self {
        Self {
            chunks,
            warmup: Duration::ZERO,
            pause: Duration::from_millis(15),
            failure: Failure::Never,
            calls: AtomicUsize::new(0),
        }
    }

    fn failing(mut self, failure: Failure) -> Self {
        self.failure = failure;
        self
    }

    fn slow_start(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    fn pausing(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Producer for CountingProducer {
    async fn produce(
        &self,
        _id: &str,
        sink: ChunkSink,
        _options: &ProduceOptions,
    ) -> Result<(), ProduceError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 && matches!(self.failure, Failure::FirstCallUpfront) {
            return Err(ProduceError::Other("source unavailable".to_string()));
        }
        tokio::time::sleep(self.warmup).await;
        for chunk in &self.chunks {
            sink.write(Bytes::from_static(*chunk)).await?;
            tokio::time::sleep(self.pause).await;
            if matches!(self.failure, Failure::AfterFirstChunk) {
                return Err(ProduceError::Transcoder("corrupt frame".to_string()));
            }
        }
        Ok(())
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn coordinator(producer: Arc<CountingProducer>) -> IngestionCoordinator {
    coordinator_with_lease(producer, Duration::from_secs(5))
}

fn coordinator_with_lease(
    producer: Arc<CountingProducer>,
    lease: Duration,
) -> IngestionCoordinator {
    let cache = StreamingCache::new(
        Arc::new(MemoryLogStore::new()),
        CacheConfig {
            poll_timeout: Duration::from_millis(10),
            max_empty_polls: 20,
            ..Default::default()
        },
    );
    let lock = MemoryLock::new(LockConfig {
        lease,
        acquire_timeout: Duration::from_secs(5),
        retry_interval: Duration::from_millis(5),
    });
    IngestionCoordinator::new(cache, Arc::new(lock), producer, ProduceOptions::default())
}

async fn drain(mut rx: mpsc::Receiver<Bytes>) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = rx.recv().await {
        out.extend_from_slice(&chunk);
    }
    out
}

async fn fetch(
    coordinator: &IngestionCoordinator,
    id: &str,
) -> (Result<TailOutcome, CacheError>, Vec<u8>) {
    let (sink, rx) = ChunkSink::channel(4);
    let reader = tokio::spawn(drain(rx));
    let result = coordinator.stream_to(id, sink).await;
    (result, reader.await.unwrap())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn concurrent_requests_trigger_one_production() {
    let producer = Arc::new(CountingProducer::new(vec![
        &b"chunk-1 "[..],
        &b"chunk-2 "[..],
        &b"chunk-3"[..],
    ]));
    let coordinator = coordinator(Arc::clone(&producer));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            fetch(&coordinator, "shared").await
        }));
    }

    for handle in handles {
        let (result, bytes) = handle.await.unwrap();
        assert_eq!(result.unwrap(), TailOutcome::Complete { bytes: 23 });
        assert_eq!(bytes, b"chunk-1 chunk-2 chunk-3");
    }
    assert_eq!(producer.calls(), 1);
}

#[tokio::test]
async fn slow_first_byte_does_not_outlive_the_lock() {
    // The first byte arrives well after the lease would have run out.
    let producer = Arc::new(
        CountingProducer::new(vec![&b"AAAA"[..], &b"BBBB"[..]])
            .slow_start(Duration::from_millis(300)),
    );
    let coordinator = coordinator_with_lease(Arc::clone(&producer), Duration::from_millis(100));

    let (first, second) = tokio::join!(
        fetch(&coordinator, "abc123"),
        fetch(&coordinator, "abc123")
    );
    for (result, bytes) in [first, second] {
        assert_eq!(result.unwrap(), TailOutcome::Complete { bytes: 8 });
        assert_eq!(bytes, b"AAAABBBB");
    }
    assert_eq!(producer.calls(), 1);
    assert_eq!(coordinator.get_length("abc123").await.unwrap(), Some(8));
}

#[tokio::test]
async fn stalled_production_does_not_hold_the_triggering_caller() {
    let producer = Arc::new(
        CountingProducer::new(vec![&b"head"[..], &b"tail"[..]]).pausing(Duration::from_secs(5)),
    );
    let coordinator = coordinator(Arc::clone(&producer));

    // 20 empty polls of 10 ms each, far less than the producer's pause.
    let (result, bytes) =
        tokio::time::timeout(Duration::from_secs(2), fetch(&coordinator, "stuck"))
            .await
            .expect("abandoned tail should return without waiting for production");
    assert_eq!(result.unwrap(), TailOutcome::Abandoned { bytes: 4 });
    assert_eq!(bytes, b"head");
    assert_eq!(coordinator.get_length("stuck").await.unwrap(), None);
}

#[tokio::test]
async fn later_request_is_served_from_cache() {
    let producer = Arc::new(CountingProducer::new(vec![&b"b1"[..], &b"b2"[..]]));
    let coordinator = coordinator(Arc::clone(&producer));

    let (first, bytes) = fetch(&coordinator, "abc123").await;
    assert!(first.unwrap().is_complete());
    assert_eq!(bytes, b"b1b2");
    assert_eq!(coordinator.get_length("abc123").await.unwrap(), Some(4));

    let (second, bytes) = fetch(&coordinator, "abc123").await;
    assert_eq!(second.unwrap(), TailOutcome::Complete { bytes: 4 });
    assert_eq!(bytes, b"b1b2");
    assert_eq!(producer.calls(), 1);
}

#[tokio::test]
async fn failed_production_leaves_no_cache_and_is_retried() {
    let producer = Arc::new(
        CountingProducer::new(vec![&b"ok"[..]]).failing(Failure::FirstCallUpfront),
    );
    let coordinator = coordinator(Arc::clone(&producer));

    let (result, bytes) = fetch(&coordinator, "flaky").await;
    let err = result.unwrap_err();
    assert!(matches!(err, CacheError::Production { ref id, .. } if id == "flaky"));
    assert!(bytes.is_empty());
    assert!(!coordinator.has("flaky").await.unwrap());

    let (retry, bytes) = fetch(&coordinator, "flaky").await;
    assert!(retry.unwrap().is_complete());
    assert_eq!(bytes, b"ok");
    assert_eq!(producer.calls(), 2);
}

#[tokio::test]
async fn failure_after_first_byte_reaches_the_triggering_caller() {
    let producer = Arc::new(
        CountingProducer::new(vec![&b"head"[..], &b"tail"[..]]).failing(Failure::AfterFirstChunk),
    );
    let coordinator = coordinator(Arc::clone(&producer));

    let (result, _) = fetch(&coordinator, "midway").await;
    assert!(matches!(result, Err(CacheError::Production { .. })));
    assert!(!coordinator.has("midway").await.unwrap());
    assert_eq!(coordinator.get_length("midway").await.unwrap(), None);
}

#[tokio::test]
async fn warm_triggers_once_and_stream_reuses_it() {
    let producer = Arc::new(CountingProducer::new(vec![&b"warm"[..], &b"ed"[..]]));
    let coordinator = coordinator(Arc::clone(&producer));

    assert!(coordinator.warm("prefetch").await.unwrap());
    assert!(!coordinator.warm("prefetch").await.unwrap());
    assert!(coordinator.has("prefetch").await.unwrap());

    let (result, bytes) = fetch(&coordinator, "prefetch").await;
    assert!(result.unwrap().is_complete());
    assert_eq!(bytes, b"warmed");
    assert_eq!(producer.calls(), 1);
}

#[tokio::test]
async fn distinct_ids_are_produced_independently() {
    let producer = Arc::new(CountingProducer::new(vec![&b"x"[..]]));
    let coordinator = coordinator(Arc::clone(&producer));

    let (a, b) = tokio::join!(fetch(&coordinator, "one"), fetch(&coordinator, "two"));
    assert!(a.0.unwrap().is_complete());
    assert!(b.0.unwrap().is_complete());
    assert_eq!(producer.calls(), 2);
}

#[tokio::test]
async fn shutdown_lets_running_production_finish() {
    let producer = Arc::new(CountingProducer::new(vec![&b"a"[..], &b"b"[..], &b"c"[..]]));
    let coordinator = coordinator(Arc::clone(&producer));

    assert!(coordinator.warm("closing").await.unwrap());
    assert!(coordinator.shutdown(Duration::from_secs(5)).await);
    assert_eq!(coordinator.get_length("closing").await.unwrap(), Some(3));
}
