use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Small key-value surface over Redis: TTL values, atomic counters and a
/// best-effort lease. Losing the cache only widens at-most-once to
/// at-least-once, which every downstream write tolerates.
#[derive(Clone)]
pub struct CacheStore {
    manager: ConnectionManager,
}

impl CacheStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("invalid redis url")?;
        let manager = client
            .get_connection_manager()
            .await
            .context("failed to connect to redis")?;
        Ok(Self { manager })
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .context("redis ping failed")?;
        Ok(())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.get(key).await.context("redis get failed")?;
        match raw {
            Some(raw) => Ok(Some(
                serde_json::from_str(&raw).context("cached value failed to decode")?,
            )),
            None => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let raw = serde_json::to_string(value).context("value failed to encode")?;
        conn.set_ex::<_, _, ()>(key, raw, ttl.as_secs())
            .await
            .context("redis setex failed")?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        conn.del::<_, ()>(key).await.context("redis del failed")?;
        Ok(())
    }

    /// Atomic counter with a TTL anchored at the first increment; backs the
    /// per-plot command rate limits.
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut conn = self.manager.clone();
        let count: i64 = conn.incr(key, 1).await.context("redis incr failed")?;
        if count == 1 {
            conn.expire::<_, ()>(key, ttl.as_secs() as i64)
                .await
                .context("redis expire failed")?;
        }
        Ok(count)
    }

    /// Set-if-absent lease with TTL; the dedup gate for scheduled work.
    /// Returns true when this caller won the lease.
    pub async fn acquire_lease(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.manager.clone();
        let outcome: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("redis set nx failed")?;
        Ok(outcome.is_some())
    }

    pub async fn release_lease(&self, key: &str) -> Result<()> {
        self.delete(key).await
    }
}
