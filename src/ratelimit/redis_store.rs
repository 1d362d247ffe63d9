//! Redis-backed counter store, shared by every gateway instance.

use super::store::{Acquire, CounterState, CounterStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::fmt;
use std::time::Duration;

/// Compare-and-increment in one round trip. Returns `{allowed, count, ttl}`.
const ACQUIRE_SCRIPT: &str = r"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local sliding = ARGV[3] == '1'
local ttl = redis.call('TTL', KEYS[1])
if current >= limit then
  if ttl < 0 then ttl = window end
  return {0, current, ttl}
end
local count = redis.call('INCR', KEYS[1])
if count == 1 or sliding or ttl < 0 then
  redis.call('EXPIRE', KEYS[1], window)
  ttl = window
end
return {1, count, ttl}
";

pub struct RedisStore {
    connection: ConnectionManager,
    script: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Open a managed connection. Fails if the server is unreachable.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("Invalid redis URL")?;
        let connection = ConnectionManager::new(client)
            .await
            .context("Failed to connect to redis")?;
        Ok(Self {
            connection,
            script: Script::new(ACQUIRE_SCRIPT),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &str {
        "redis"
    }

    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window: Duration,
        sliding: bool,
    ) -> Result<Acquire> {
        let mut conn = self.connection.clone();
        let window_secs = window.as_secs().max(1);
        let (allowed, count, ttl): (i64, i64, i64) = self
            .script
            .key(key)
            .arg(limit)
            .arg(window_secs)
            .arg(if sliding { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .context("Rate-limit script failed")?;

        Ok(Acquire {
            allowed: allowed == 1,
            count: u32::try_from(count).unwrap_or(u32::MAX),
            ttl_secs: u64::try_from(ttl).unwrap_or(window_secs),
        })
    }

    async fn peek(&self, key: &str) -> Result<Option<CounterState>> {
        let mut conn = self.connection.clone();
        let (count, ttl): (Option<u32>, i64) = redis::pipe()
            .get(key)
            .ttl(key)
            .query_async(&mut conn)
            .await
            .context("Failed to read rate-limit counter")?;

        Ok(count.map(|count| CounterState {
            count,
            ttl_secs: u64::try_from(ttl).unwrap_or(0),
        }))
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut conn = self.connection.clone();
        let removed: i64 = conn
            .del(key)
            .await
            .context("Failed to delete rate-limit counter")?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis ping failed")?;
        anyhow::ensure!(pong == "PONG", "unexpected PING reply: {pong}");
        Ok(())
    }
}
