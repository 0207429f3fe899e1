//! Byte sinks connecting producers, the cache and consumers.
//!
//! A [`ChunkSink`] is the sending half of a bounded channel of byte chunks.
//! Dropping every clone of the sink closes it; the receiver then sees the end
//! of the stream.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// The receiving side of the sink has gone away.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("sink receiver dropped")]
pub struct SinkClosed;

#[derive(Clone, Debug)]
pub struct ChunkSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChunkSink {
    /// Create a sink and its receiver, buffering at most `capacity` chunks.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Send one chunk, waiting for buffer space if the consumer is behind.
    pub async fn write(&self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(chunk).await.map_err(|_| SinkClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
