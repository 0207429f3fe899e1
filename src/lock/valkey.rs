//! Valkey lease lock: `SET key token NX PX lease`, released with a
//! compare-and-delete script so a holder never frees someone else's lease.

use super::{DistributedLock, LockConfig, LockError, LockHandle};
use async_trait::async_trait;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct ValkeyLock {
    conn: ConnectionManager,
    release: Script,
    extend: Script,
    config: LockConfig,
}

impl ValkeyLock {
    pub async fn connect(url: &str, config: LockConfig) -> Result<Self, LockError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Lock service connected to Valkey at {}", url);
        Ok(Self::with_connection(conn, config))
    }

    pub fn with_connection(conn: ConnectionManager, config: LockConfig) -> Self {
        Self {
            conn,
            release: Script::new(RELEASE_SCRIPT),
            extend: Script::new(EXTEND_SCRIPT),
            config,
        }
    }
}

#[async_trait]
impl DistributedLock for ValkeyLock {
    async fn acquire(&self, key: &str) -> Result<LockHandle, LockError> {
        let started = Instant::now();
        let handle = LockHandle::issue(key);
        let lease_ms = self.config.lease.as_millis() as u64;
        let mut conn = self.conn.clone();

        loop {
            let granted: Option<String> = redis::cmd("SET")
                .arg(key)
                .arg(&handle.token)
                .arg("NX")
                .arg("PX")
                .arg(lease_ms)
                .query_async(&mut conn)
                .await?;
            if granted.is_some() {
                debug!("Acquired lock {}", key);
                return Ok(handle);
            }

            let waited = started.elapsed();
            if waited >= self.config.acquire_timeout {
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited,
                });
            }
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }

    async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(&handle.key)
            .arg(&handle.token)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            warn!("Lock {} expired before release", handle.key);
        } else {
            debug!("Released lock {}", handle.key);
        }
        Ok(())
    }

    async fn extend(&self, handle: &LockHandle) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();
        let renewed: i64 = self
            .extend
            .key(&handle.key)
            .arg(&handle.token)
            .arg(self.config.lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await?;
        Ok(renewed == 1)
    }

    fn lease(&self) -> Duration {
        self.config.lease
    }
}
