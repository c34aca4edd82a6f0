//! Redis-backed store.

use super::Store;
use crate::Result;
use async_trait::async_trait;
use redis::{aio::ConnectionManager, aio::MultiplexedConnection, AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Connections kept around for blocking pops.
const BLOCKING_POOL_MAX: usize = 16;

/// Store implementation backed by a Redis server.
///
/// Regular traffic rides a [`ConnectionManager`], which transparently
/// reconnects after transient failures. Blocking pops (`BRPOP`) would stall
/// every command multiplexed behind them, so they run on dedicated
/// connections checked out of a small internal free-list instead; a
/// connection that errors mid-pop is discarded rather than returned.
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
    blocking: Arc<Mutex<Vec<MultiplexedConnection>>>,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379/0`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        let store = Self {
            client,
            conn,
            blocking: Arc::new(Mutex::new(Vec::new())),
        };
        store.ping().await?;
        Ok(store)
    }

    async fn checkout_blocking(&self) -> Result<MultiplexedConnection> {
        if let Some(conn) = self.blocking.lock().await.pop() {
            return Ok(conn);
        }
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    async fn check_in_blocking(&self, conn: MultiplexedConnection) {
        let mut pool = self.blocking.lock().await;
        if pool.len() < BLOCKING_POOL_MAX {
            pool.push(conn);
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn push_left(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn pop_right(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.rpop(key, None).await?;
        Ok(value)
    }

    async fn pop_right_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.checkout_blocking().await?;
        let reply: Option<(String, String)> =
            match conn.brpop(key, timeout.as_secs_f64()).await {
                Ok(reply) => reply,
                Err(e) => return Err(e.into()),
            };
        self.check_in_blocking(conn).await;
        Ok(reply.map(|(_, value)| value))
    }

    async fn remove_value(&self, key: &str, value: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.lrem(key, 1, value).await?;
        Ok(removed as u64)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.llen(key).await?;
        Ok(len as u64)
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let entries: Vec<String> = conn.lrange(key, start, stop).await?;
        Ok(entries)
    }

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, member, score).await?;
        Ok(())
    }

    async fn zset_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn.zrangebyscore(key, min, max).await?;
        Ok(members)
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.zrem(key, member).await?;
        Ok(removed > 0)
    }

    async fn zset_len(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: i64 = conn.zcard(key).await?;
        Ok(len as u64)
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.hset::<_, _, _, ()>(key, field, value).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 = conn.hincr(key, field, delta).await?;
        Ok(value)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("PING").query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
