//! KV store contract plus deterministic implementations for tests and
//! single-process deployments.
//!
//! The engine and the token authority rely on the KV store's single-operation
//! atomicity: set-if-absent for duplicate detection, ordered-set add for
//! velocity markers, TTL-on-write for expiry. Callers must not read-then-write
//! where one of these primitives suffices.

use crate::error::ShieldError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, ShieldError>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ShieldError>;

    /// Atomic set-if-absent with TTL. Returns `true` when this call created
    /// the key, `false` when the key already existed.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, ShieldError>;

    async fn del(&self, key: &str) -> Result<(), ShieldError>;

    async fn exists(&self, key: &str) -> Result<bool, ShieldError>;

    /// Add `member` with `score` to the ordered set at `key`; re-adding an
    /// existing member updates its score.
    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), ShieldError>;

    /// Count ordered-set members with score in `[min, max]`.
    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64, ShieldError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ShieldError>;
}

enum Slot {
    Value(String),
    Zset(BTreeMap<String, i64>),
}

struct Entry {
    slot: Slot,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process KV store with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryKv {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every key, emulating a cache flush or restart.
    pub fn clear(&self) {
        if let Ok(mut map) = self.inner.lock() {
            map.clear();
        }
    }

    fn with_entries<R>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Entry>) -> R,
    ) -> Result<R, ShieldError> {
        let mut map = self
            .inner
            .lock()
            .map_err(|_| ShieldError::Kv("kv lock poisoned".to_string()))?;
        let now = Instant::now();
        map.retain(|_, entry| !entry.expired(now));
        Ok(f(&mut map))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, ShieldError> {
        self.with_entries(|map| match map.get(key) {
            Some(Entry {
                slot: Slot::Value(value),
                ..
            }) => Some(value.clone()),
            _ => None,
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ShieldError> {
        self.with_entries(|map| {
            map.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Value(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
        })
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, ShieldError> {
        self.with_entries(|map| {
            if map.contains_key(key) {
                return false;
            }
            map.insert(
                key.to_string(),
                Entry {
                    slot: Slot::Value(value.to_string()),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            true
        })
    }

    async fn del(&self, key: &str) -> Result<(), ShieldError> {
        self.with_entries(|map| {
            map.remove(key);
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, ShieldError> {
        self.with_entries(|map| map.contains_key(key))
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), ShieldError> {
        self.with_entries(|map| {
            let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
                slot: Slot::Zset(BTreeMap::new()),
                expires_at: None,
            });
            if let Slot::Zset(members) = &mut entry.slot {
                members.insert(member.to_string(), score);
            }
        })
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64, ShieldError> {
        self.with_entries(|map| match map.get(key) {
            Some(Entry {
                slot: Slot::Zset(members),
                ..
            }) => members
                .values()
                .filter(|score| (min..=max).contains(*score))
                .count() as u64,
            _ => 0,
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ShieldError> {
        self.with_entries(|map| {
            if let Some(entry) = map.get_mut(key) {
                entry.expires_at = Some(Instant::now() + ttl);
            }
        })
    }
}

/// Deterministic failing KV store useful for chaos testing.
#[derive(Debug, Clone, Default)]
pub struct FailingKv;

impl FailingKv {
    fn fail<T>() -> Result<T, ShieldError> {
        Err(ShieldError::Kv("injected kv failure".to_string()))
    }
}

#[async_trait]
impl KvStore for FailingKv {
    async fn get(&self, _key: &str) -> Result<Option<String>, ShieldError> {
        Self::fail()
    }

    async fn set_ex(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<(), ShieldError> {
        Self::fail()
    }

    async fn set_nx_ex(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> Result<bool, ShieldError> {
        Self::fail()
    }

    async fn del(&self, _key: &str) -> Result<(), ShieldError> {
        Self::fail()
    }

    async fn exists(&self, _key: &str) -> Result<bool, ShieldError> {
        Self::fail()
    }

    async fn zadd(&self, _key: &str, _member: &str, _score: i64) -> Result<(), ShieldError> {
        Self::fail()
    }

    async fn zcount(&self, _key: &str, _min: i64, _max: i64) -> Result<u64, ShieldError> {
        Self::fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<(), ShieldError> {
        Self::fail()
    }
}

/// KV wrapper that stalls operations on keys with a given prefix, useful for
/// exercising the scoring deadline.
pub struct StallKv {
    inner: Arc<dyn KvStore>,
    prefix: String,
    delay: Duration,
}

impl StallKv {
    pub fn new(inner: Arc<dyn KvStore>, prefix: impl Into<String>, delay: Duration) -> Self {
        Self {
            inner,
            prefix: prefix.into(),
            delay,
        }
    }

    async fn stall(&self, key: &str) {
        if key.starts_with(&self.prefix) {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl KvStore for StallKv {
    async fn get(&self, key: &str) -> Result<Option<String>, ShieldError> {
        self.stall(key).await;
        self.inner.get(key).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ShieldError> {
        self.stall(key).await;
        self.inner.set_ex(key, value, ttl).await
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, ShieldError> {
        self.stall(key).await;
        self.inner.set_nx_ex(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> Result<(), ShieldError> {
        self.stall(key).await;
        self.inner.del(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, ShieldError> {
        self.stall(key).await;
        self.inner.exists(key).await
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), ShieldError> {
        self.stall(key).await;
        self.inner.zadd(key, member, score).await
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64, ShieldError> {
        self.stall(key).await;
        self.inner.zcount(key, min, max).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ShieldError> {
        self.stall(key).await;
        self.inner.expire(key, ttl).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_only_first_writer_wins() {
        let kv = MemoryKv::new();
        assert!(kv
            .set_nx_ex("fraud:duplicate:INV-1", "1", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(!kv
            .set_nx_ex("fraud:duplicate:INV-1", "1", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn concurrent_set_nx_has_exactly_one_winner() {
        let kv = Arc::new(MemoryKv::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.set_nx_ex("fraud:duplicate:INV-RACE", "1", Duration::from_secs(60))
                    .await
                    .unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn expired_values_are_gone() {
        let kv = MemoryKv::new();
        kv.set_ex("k", "v", Duration::from_millis(5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert!(!kv.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn zcount_filters_by_score_range() {
        let kv = MemoryKv::new();
        kv.zadd("v", "a", 100).await.unwrap();
        kv.zadd("v", "b", 200).await.unwrap();
        kv.zadd("v", "c", 300).await.unwrap();

        assert_eq!(kv.zcount("v", 150, i64::MAX).await.unwrap(), 2);
        assert_eq!(kv.zcount("v", 0, i64::MAX).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn zadd_same_member_updates_score_in_place() {
        let kv = MemoryKv::new();
        kv.zadd("v", "a", 100).await.unwrap();
        kv.zadd("v", "a", 500).await.unwrap();

        assert_eq!(kv.zcount("v", 0, i64::MAX).await.unwrap(), 1);
        assert_eq!(kv.zcount("v", 400, i64::MAX).await.unwrap(), 1);
    }
}
