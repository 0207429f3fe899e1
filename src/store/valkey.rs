//! Valkey/Redis stream backed log store.
//!
//! Each log is a stream. The record payload is stored under the `chunk` field
//! and metadata entries become additional fields. Blocking reads (`XREAD
//! BLOCK`) hold their connection for the whole wait, so they run on dedicated
//! connections from a small pool instead of the shared multiplexed manager.

use super::{Batch, EntryId, LogStore, Record, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Stream field holding the record payload.
const PAYLOAD_FIELD: &str = "chunk";

/// Idle blocking-read connections kept around for reuse.
const MAX_IDLE_READERS: usize = 32;

#[derive(Clone)]
pub struct ValkeyLogStore {
    client: Client,
    conn: ConnectionManager,
    readers: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl ValkeyLogStore {
    /// Connect to the Valkey server at `url`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        info!("Log store connected to Valkey at {}", url);
        Ok(Self {
            client,
            conn,
            readers: Arc::new(Mutex::new(Vec::new())),
        })
    }

    async fn checkout_reader(&self) -> Result<MultiplexedConnection, StoreError> {
        let idle = self
            .readers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop();
        match idle {
            Some(conn) => Ok(conn),
            None => Ok(self.client.get_multiplexed_async_connection().await?),
        }
    }

    fn checkin_reader(&self, conn: MultiplexedConnection) {
        let mut idle = self.readers.lock().unwrap_or_else(|p| p.into_inner());
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
    }
}

fn decode_entry(key: &str, entry: &StreamId) -> Result<(EntryId, Record), StoreError> {
    let id = entry.id.parse::<EntryId>().map_err(|reason| StoreError::Malformed {
        key: key.to_string(),
        reason,
    })?;

    let mut payload = None;
    let mut metadata = HashMap::new();
    for (field, value) in &entry.map {
        let bytes: Vec<u8> =
            redis::from_redis_value(value).map_err(|e| StoreError::Malformed {
                key: key.to_string(),
                reason: format!("field {field} of {id}: {e}"),
            })?;
        if field == PAYLOAD_FIELD {
            payload = Some(Bytes::from(bytes));
        } else {
            metadata.insert(field.clone(), String::from_utf8_lossy(&bytes).into_owned());
        }
    }

    let payload = payload.ok_or_else(|| StoreError::Malformed {
        key: key.to_string(),
        reason: format!("entry {id} has no {PAYLOAD_FIELD} field"),
    })?;
    Ok((id, Record { payload, metadata }))
}

#[async_trait]
impl LogStore for ValkeyLogStore {
    async fn append(&self, key: &str, record: Record) -> Result<EntryId, StoreError> {
        let mut fields: Vec<(&str, &[u8])> = Vec::with_capacity(1 + record.metadata.len());
        fields.push((PAYLOAD_FIELD, record.payload.as_ref()));
        for (field, value) in &record.metadata {
            fields.push((field.as_str(), value.as_bytes()));
        }

        let mut conn = self.conn.clone();
        let id: String = conn.xadd(key, "*", &fields[..]).await?;
        id.parse().map_err(|reason| StoreError::Malformed {
            key: key.to_string(),
            reason,
        })
    }

    async fn read_from(
        &self,
        key: &str,
        after: EntryId,
        block: Duration,
    ) -> Result<Batch, StoreError> {
        // BLOCK 0 waits forever.
        let block_ms = (block.as_millis() as usize).max(1);
        let options = StreamReadOptions::default().block(block_ms);
        let mut conn = self.checkout_reader().await?;
        let reply: Option<StreamReadReply> = match conn
            .xread_options(&[key], &[after.to_string()], &options)
            .await
        {
            Ok(reply) => reply,
            Err(e) => {
                warn!("XREAD on {} failed, dropping reader connection: {}", key, e);
                return Err(e.into());
            }
        };
        self.checkin_reader(conn);

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        reply
            .keys
            .iter()
            .filter(|stream| stream.key == key)
            .flat_map(|stream| stream.ids.iter())
            .map(|entry| decode_entry(key, entry))
            .collect()
    }

    async fn last(&self, key: &str) -> Result<Option<(EntryId, Record)>, StoreError> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrevrange_count(key, "+", "-", 1).await?;
        reply
            .ids
            .first()
            .map(|entry| decode_entry(key, entry))
            .transpose()
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.exists(key).await?)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: bool = conn.expire(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.del(key).await?;
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "valkey"
    }
}
