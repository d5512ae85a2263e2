//! Redis-backed queue store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::QueueStore;
use crate::error::QueueError;

/// Queue store backed by Redis lists.
///
/// The connection manager reconnects transparently, so a store outage only
/// surfaces as `QueueError::StoreUnavailable` on the calls made during it.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::StoreUnavailable` if the connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }

    /// Creates a store from an existing connection manager.
    pub fn from_connection(redis: ConnectionManager) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl QueueStore for RedisStore {
    async fn push(&self, queue: &str, payload: String) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(queue, payload).await?;
        Ok(())
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let item: Option<String> = conn.rpop(queue, None).await?;
        Ok(item)
    }

    async fn len(&self, queue: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(queue).await?;
        Ok(len)
    }

    async fn remove(&self, queue: &str, payload: &str) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let removed: usize = conn.lrem(queue, 1, payload).await?;
        Ok(removed)
    }

    async fn range(&self, queue: &str, limit: usize) -> Result<Vec<String>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let items: Vec<String> = conn.lrange(queue, 0, limit as isize - 1).await?;
        Ok(items)
    }

    async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(())
    }
}
