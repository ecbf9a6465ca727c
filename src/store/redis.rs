use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, RedisError};

use super::{glob_prefix, CacheStore, StoreError};

/// Keys requested per `SCAN` round trip during prefix deletes.
const SCAN_BATCH: usize = 100;

/// [`CacheStore`] over a Redis server reached through a multiplexed,
/// self-reconnecting [`ConnectionManager`].
///
/// Cloning the manager is cheap; each call works on its own clone so
/// concurrent requests share one socket.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Open a connection to `url` (`redis://[:password@]host:port[/db]`).
    ///
    /// The first connection is made eagerly and answered with a `PING`, so
    /// an unreachable server fails here instead of on the first request.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Protocol(format!("invalid redis url: {}", e)))?;
        let conn = match tokio::time::timeout(timeout, client.get_connection_manager()).await {
            Ok(conn) => conn.map_err(map_error)?,
            Err(_) => {
                return Err(StoreError::Timeout {
                    op: "connect",
                    after_ms: timeout.as_millis() as u64,
                })
            }
        };
        let store = Self { conn };
        crate::util::bounded(timeout, "ping", store.ping()).await?;
        Ok(store)
    }
}

fn map_error(err: RedisError) -> StoreError {
    if err.is_io_error() || err.is_connection_refusal() || err.is_timeout() || err.is_connection_dropped() {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Protocol(err.to_string())
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

#[async_trait::async_trait]
impl CacheStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let n: i64 = ::redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        u64::try_from(n).map_err(|_| StoreError::Protocol(format!("negative counter {}", n)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let set: i64 = ::redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        Ok(set == 1)
    }

    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError> {
        let mut conn = self.conn.clone();
        let secs: i64 = ::redis::cmd("TTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        // -2: missing key, -1: no expiry
        Ok((secs >= 0).then(|| Duration::from_secs(secs as u64)))
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        let pattern = glob_prefix(prefix);
        let mut cursor: u64 = 0;
        let mut removed: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(map_error)?;
            if !keys.is_empty() {
                let n: i64 = ::redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(map_error)?;
                removed += n.max(0) as u64;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(removed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let reply: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_error)?;
        if reply == "PONG" {
            Ok(())
        } else {
            Err(StoreError::Protocol(format!("unexpected PING reply '{}'", reply)))
        }
    }
}
