//! Redis-backed KV store over a shared `ConnectionManager`.
//!
//! The manager multiplexes one connection with automatic reconnect; every
//! operation clones the handle, so the adapter itself holds no locks.

use async_trait::async_trait;
use payshield_core::{KvStore, ShieldError};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;

#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> Result<Self, ShieldError> {
        let client = redis::Client::open(url).map_err(ShieldError::kv)?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(ShieldError::kv)?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, ShieldError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(ShieldError::kv)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ShieldError> {
        let mut conn = self.conn.clone();
        conn.set_ex(key, value, ttl.as_secs().max(1))
            .await
            .map_err(ShieldError::kv)
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, ShieldError> {
        let mut conn = self.conn.clone();
        // Single SET with NX and EX keeps the check-and-write atomic.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(ShieldError::kv)?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> Result<(), ShieldError> {
        let mut conn = self.conn.clone();
        conn.del(key).await.map_err(ShieldError::kv)
    }

    async fn exists(&self, key: &str) -> Result<bool, ShieldError> {
        let mut conn = self.conn.clone();
        conn.exists(key).await.map_err(ShieldError::kv)
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<(), ShieldError> {
        let mut conn = self.conn.clone();
        conn.zadd(key, member, score).await.map_err(ShieldError::kv)
    }

    async fn zcount(&self, key: &str, min: i64, max: i64) -> Result<u64, ShieldError> {
        let mut conn = self.conn.clone();
        conn.zcount(key, min, max).await.map_err(ShieldError::kv)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), ShieldError> {
        let mut conn = self.conn.clone();
        conn.expire(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(ShieldError::kv)
    }
}
