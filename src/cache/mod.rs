//! Key/value caches shared by the extraction orchestrator and the validation engine.
//!
//! Both implementations are safe to share across worker tasks. The in-memory cache is a
//! bounded LRU; the Redis cache lets several worker processes see the same entries.

pub mod memory;
pub mod redis;

use async_trait::async_trait;

pub use self::memory::LruCache;
pub use self::redis::RedisCache;

#[async_trait]
pub trait Cache<V>: Send + Sync {
    async fn get(&self, key: &str) -> Option<V>;

    async fn put(&self, key: &str, value: V);

    async fn evict(&self, key: &str);

    async fn len(&self) -> usize;
}
