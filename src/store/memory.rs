//! In-memory store for tests and development.

use super::Store;
use crate::Result;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct MemoryInner {
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, Vec<(i64, String)>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

/// A [`Store`] that keeps everything in process memory.
///
/// Implements the full store contract, including blocking pops, so queue and
/// worker behavior can be exercised without a Redis server. Not durable;
/// intended for tests and local development only.
///
/// # Examples
///
/// ```rust
/// use conveyor::store::{MemoryStore, Store};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> conveyor::Result<()> {
/// let store = MemoryStore::new();
/// store.push_left("list", "a").await?;
/// assert_eq!(store.pop_right("list").await?, Some("a".to_string()));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
    notify: Arc<Notify>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_pop_right(&self, key: &str) -> Option<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.lists.get_mut(key).and_then(|list| list.pop_back())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn push_left(&self, key: &str, value: &str) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner
                .lists
                .entry(key.to_string())
                .or_default()
                .push_front(value.to_string());
        }
        self.notify.notify_one();
        Ok(())
    }

    async fn pop_right(&self, key: &str) -> Result<Option<String>> {
        Ok(self.try_pop_right(key))
    }

    async fn pop_right_blocking(&self, key: &str, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(value) = self.try_pop_right(key) {
                return Ok(Some(value));
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn remove_value(&self, key: &str, value: &str) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.lists.get_mut(key) {
            if let Some(pos) = list.iter().position(|entry| entry == value) {
                list.remove(pos);
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn list_len(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.lists.get(key).map_or(0, |list| list.len() as u64))
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let resolve = |index: isize| -> isize {
            if index < 0 { len + index } else { index }
        };
        let from = resolve(start).max(0);
        let to = resolve(stop).min(len - 1);
        if from > to || len == 0 {
            return Ok(Vec::new());
        }
        Ok(list
            .iter()
            .skip(from as usize)
            .take((to - from + 1) as usize)
            .cloned()
            .collect())
    }

    async fn zset_add(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let zset = inner.zsets.entry(key.to_string()).or_default();
        zset.retain(|(_, m)| m != member);
        zset.push((score, member.to_string()));
        zset.sort();
        Ok(())
    }

    async fn zset_range_by_score(&self, key: &str, min: i64, max: i64) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.zsets.get(key).map_or(Vec::new(), |zset| {
            zset.iter()
                .filter(|(score, _)| *score >= min && *score <= max)
                .map(|(_, member)| member.clone())
                .collect()
        }))
    }

    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(zset) = inner.zsets.get_mut(key) {
            let before = zset.len();
            zset.retain(|(_, m)| m != member);
            return Ok(zset.len() < before);
        }
        Ok(false)
    }

    async fn zset_len(&self, key: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.zsets.get(key).map_or(0, |zset| zset.len() as u64))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .hashes
            .get(key)
            .and_then(|hash| hash.get(field))
            .cloned())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .hashes
            .get_mut(key)
            .map_or(false, |hash| hash.remove(field).is_some()))
    }

    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let current: i64 = hash
            .get(field)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn delete_keys(&self, keys: &[String]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for key in keys {
            inner.lists.remove(key);
            inner.zsets.remove(key);
            inner.hashes.remove(key);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
