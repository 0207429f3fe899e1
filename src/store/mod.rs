//! Append-only, per-key entry logs.
//!
//! A [`LogStore`] holds one ordered log per key. Entries are appended at the
//! tail, addressed by a monotonically increasing [`EntryId`], and read back in
//! append order. Whole keys can be expired or deleted. The semantics follow
//! Redis streams, so the Valkey backend maps each operation onto a single
//! command.

pub mod memory;
#[cfg(feature = "valkey")]
pub mod valkey;

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryLogStore;
#[cfg(feature = "valkey")]
pub use valkey::ValkeyLogStore;

/// Errors raised by a log store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "valkey")]
    #[error("Valkey command failed: {0}")]
    Valkey(#[from] redis::RedisError),

    #[error("Log store unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed entry in {key}: {reason}")]
    Malformed { key: String, reason: String },
}

/// Position of an entry inside a log.
///
/// Ids compare as `(millis, seq)` pairs, matching Redis stream ids.
/// [`EntryId::ZERO`] sorts before every real entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId {
    pub millis: u64,
    pub seq: u64,
}

impl EntryId {
    /// Cursor that reads a log from its first entry.
    pub const ZERO: EntryId = EntryId { millis: 0, seq: 0 };

    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| format!("entry id '{s}' has no sequence part"))?;
        let millis = millis
            .parse()
            .map_err(|_| format!("entry id '{s}' has a non-numeric timestamp"))?;
        let seq = seq
            .parse()
            .map_err(|_| format!("entry id '{s}' has a non-numeric sequence"))?;
        Ok(Self { millis, seq })
    }
}

/// One log entry: an opaque payload plus a small string metadata map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Record {
    pub payload: Bytes,
    pub metadata: HashMap<String, String>,
}

impl Record {
    /// A record carrying only a payload.
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            metadata: HashMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// A batch of entries as returned by [`LogStore::read_from`], in append order.
pub type Batch = Vec<(EntryId, Record)>;

/// Ordered, append-only, expiring per-key logs.
///
/// Implementations must preserve append order per key and hand out strictly
/// increasing ids. Reads of a missing key behave like reads of an empty log.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append `record` to the log at `key`, creating the log if needed.
    async fn append(&self, key: &str, record: Record) -> Result<EntryId, StoreError>;

    /// Return every entry with an id strictly greater than `after`.
    ///
    /// When no such entry exists yet, waits up to `block` for one to be
    /// appended and returns an empty batch if none arrives.
    async fn read_from(&self, key: &str, after: EntryId, block: Duration)
    -> Result<Batch, StoreError>;

    /// The most recent entry of the log, if any.
    async fn last(&self, key: &str) -> Result<Option<(EntryId, Record)>, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Expire the whole log `ttl` from now.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Short backend name for health output and logs.
    fn kind(&self) -> &'static str;
}
