//! The backing store abstraction.
//!
//! All durable queue state lives behind the [`Store`] trait: FIFO lists, the
//! delayed-job sorted set, the job record hash, and counter increments. The
//! production implementation is [`RedisStore`]; [`MemoryStore`] provides the
//! same contract in-process for tests and development.
//!
//! Callers see every operation either succeed or fail with a transient
//! [`ConveyorError::Store`](crate::ConveyorError::Store) error; reconnection
//! is the store's own responsibility.

use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Capabilities the queue engine requires from its backing store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Append a value to the head of a list.
    async fn push_left(&self, key: &str, value: &str) -> Result<()>;

    /// Pop the tail of a list without blocking.
    async fn pop_right(&self, key: &str) -> Result<Option<String>>;

    /// Pop the tail of a list, blocking up to `timeout` for a value.
    async fn pop_right_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>>;

    /// Remove the first occurrence of `value` from a list; returns the number
    /// of entries removed.
    async fn remove_value(&self, key: &str, value: &str) -> Result<u64>;

    /// Length of a list.
    async fn list_len(&self, key: &str) -> Result<u64>;

    /// Inclusive range of list entries, head first.
    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;

    /// Add a member to a sorted set with the given score, replacing any
    /// existing score.
    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<()>;

    /// Members with scores in `[min, max]`, ascending by score.
    async fn zset_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>>;

    /// Remove a member from a sorted set; returns whether it was present.
    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Cardinality of a sorted set.
    async fn zset_len(&self, key: &str) -> Result<u64>;

    /// Set a hash field.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Read a hash field.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Delete a hash field; returns whether it was present.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    /// Atomically increment a hash field, returning the new value.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64>;

    /// Delete whole keys of any kind.
    async fn delete_keys(&self, keys: &[String]) -> Result<()>;

    /// Round-trip health check.
    async fn ping(&self) -> Result<()>;
}
