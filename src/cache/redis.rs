use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{de::DeserializeOwned, Serialize};
use std::marker::PhantomData;

use super::Cache;
use crate::core::StorageResult;

/// Redis-backed cache so several worker processes share one view.
/// Backend errors are logged and treated as cache misses.
pub struct RedisCache<V> {
    connection: redis::aio::ConnectionManager,
    prefix: String,
    ttl_seconds: u64,
    _value: PhantomData<fn() -> V>,
}

impl<V> RedisCache<V> {
    pub async fn connect(url: &str, prefix: &str, ttl_seconds: u64) -> StorageResult<Self> {
        let client = redis::Client::open(url)?;
        let connection = redis::aio::ConnectionManager::new(client).await?;

        Ok(RedisCache {
            connection,
            prefix: prefix.to_string(),
            ttl_seconds: ttl_seconds.max(1),
            _value: PhantomData,
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl<V> Cache<V> for RedisCache<V>
where
    V: Serialize + DeserializeOwned + Send + Sync,
{
    async fn get(&self, key: &str) -> Option<V> {
        let mut conn = self.connection.clone();
        let raw: Option<String> = match conn.get(self.key(key)).await {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!(error = %e, "redis cache read failed");
                return None;
            }
        };

        raw.and_then(|s| serde_json::from_str(&s).ok())
    }

    async fn put(&self, key: &str, value: V) {
        let serialized = match serde_json::to_string(&value) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "cache value not serializable");
                return;
            }
        };

        let mut conn = self.connection.clone();
        let written: redis::RedisResult<()> = conn.set_ex(self.key(key), serialized, self.ttl_seconds).await;
        if let Err(e) = written {
            tracing::warn!(error = %e, "redis cache write failed");
        }
    }

    async fn evict(&self, key: &str) {
        let mut conn = self.connection.clone();
        let removed: redis::RedisResult<()> = conn.del(self.key(key)).await;
        if let Err(e) = removed {
            tracing::warn!(error = %e, "redis cache evict failed");
        }
    }

    async fn len(&self) -> usize {
        let mut conn = self.connection.clone();
        let keys: Vec<String> = conn.keys(format!("{}:*", self.prefix)).await.unwrap_or_default();
        keys.len()
    }
}
