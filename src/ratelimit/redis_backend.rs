use std::time::Duration;

use async_trait::async_trait;
use redis::{
    AsyncCommands,
    aio::ConnectionManager,
};

use crate::ratelimit::store::{CounterStore, StoreError, StoreResult};

/// Shared counter store backed by Redis sorted sets.
///
/// Constructed once at startup and injected into the limiter; the
/// connection manager reconnects on its own after transient failures.
pub struct RedisCounterStore {
    manager: ConnectionManager,
}

impl RedisCounterStore {
    pub async fn connect(url: &str, connect_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = tokio::time::timeout(connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| StoreError::Timeout {
                op: "connect",
                after: connect_timeout,
            })??;
        Ok(Self { manager })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn add(&self, key: &str, member: &str, score: f64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn remove_up_to(&self, key: &str, max_score: f64) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        let removed: u64 = conn.zrembyscore(key, "-inf", max_score).await?;
        Ok(removed)
    }

    async fn cardinality(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn oldest_score(&self, key: &str) -> StoreResult<Option<f64>> {
        let mut conn = self.manager.clone();
        let oldest: Vec<(String, f64)> = conn.zrange_withscores(key, 0, 0).await?;
        Ok(oldest.first().map(|(_, score)| *score))
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: bool = conn.expire(key, ttl_secs as i64).await?;
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> StoreResult<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: u64 = conn.del(keys).await?;
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
