//! Redis sorted-set binding of the ordered-set store port.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisError};

use super::store::{OrderedSetStore, StoreError};

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() {
            StoreError::Unavailable(e.to_string())
        } else {
            StoreError::Backend(e.to_string())
        }
    }
}

/// Sorted-set store backed by Redis (`ZREMRANGEBYSCORE`, `ZCARD`, `ZADD`, `EXPIRE`).
#[derive(Clone)]
pub struct RedisOrderedSetStore {
    connection: ConnectionManager,
}

impl std::fmt::Debug for RedisOrderedSetStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisOrderedSetStore").finish_non_exhaustive()
    }
}

impl RedisOrderedSetStore {
    /// Connect to Redis, e.g. `redis://127.0.0.1:6379/`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self { connection })
    }
}

#[async_trait]
impl OrderedSetStore for RedisOrderedSetStore {
    async fn remove_range(&self, key: &str, low: i64, high: i64) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let removed: u64 = conn.zrembyscore(key, low, high).await?;
        Ok(removed)
    }

    async fn cardinality(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = conn.zcard(key).await?;
        Ok(count)
    }

    async fn insert(&self, key: &str, score: i64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        // Round up so sub-second margins never expire early.
        let secs = ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0);
        conn.expire::<_, ()>(key, secs as i64).await?;
        Ok(())
    }
}
