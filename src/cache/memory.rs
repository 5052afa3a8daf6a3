use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use super::Cache;

struct Entry<V> {
    value: V,
    tick: u64,
}

struct LruState<V> {
    entries: HashMap<String, Entry<V>>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl<V> LruState<V> {
    fn touch(&mut self, key: &str) -> Option<&Entry<V>> {
        let tick = self.next_tick;
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.tick);
        entry.tick = tick;
        self.recency.insert(tick, key.to_string());
        self.next_tick += 1;
        self.entries.get(key)
    }
}

/// Bounded least-recently-used cache; inserting past capacity evicts the oldest entry.
pub struct LruCache<V> {
    capacity: usize,
    state: Mutex<LruState<V>>,
}

impl<V: Clone + Send + Sync> LruCache<V> {
    pub fn new(capacity: usize) -> Self {
        LruCache {
            capacity: capacity.max(1),
            state: Mutex::new(LruState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn get_sync(&self, key: &str) -> Option<V> {
        let mut state = self.state.lock();
        state.touch(key).map(|entry| entry.value.clone())
    }

    fn put_sync(&self, key: &str, value: V) {
        let mut state = self.state.lock();
        let tick = state.next_tick;
        state.next_tick += 1;

        if let Some(previous) = state.entries.insert(key.to_string(), Entry { value, tick }) {
            state.recency.remove(&previous.tick);
        }
        state.recency.insert(tick, key.to_string());

        while state.entries.len() > self.capacity {
            let oldest = match state.recency.pop_first() {
                Some((_, oldest)) => oldest,
                None => break,
            };
            state.entries.remove(&oldest);
            tracing::debug!(key = %oldest, "evicted cache entry");
        }
    }

    fn evict_sync(&self, key: &str) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.remove(key) {
            state.recency.remove(&entry.tick);
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync> Cache<V> for LruCache<V> {
    async fn get(&self, key: &str) -> Option<V> {
        self.get_sync(key)
    }

    async fn put(&self, key: &str, value: V) {
        self.put_sync(key, value)
    }

    async fn evict(&self, key: &str) {
        self.evict_sync(key)
    }

    async fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_evicts_least_recently_used() {
        let cache = LruCache::new(2);
        cache.put("a", 1).await;
        cache.put("b", 2).await;
        // "a" becomes most recent
        assert_eq!(cache.get("a").await, Some(1));
        cache.put("c", 3).await;

        assert_eq!(cache.get("b").await, None);
        assert_eq!(cache.get("a").await, Some(1));
        assert_eq!(cache.get("c").await, Some(3));
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn test_bounded_at_capacity() {
        let cache = LruCache::new(100);
        for i in 0..250 {
            cache.put(&format!("k{}", i), i).await;
        }
        assert_eq!(cache.len().await, 100);
        assert_eq!(cache.get("k149").await, None);
        assert_eq!(cache.get("k150").await, Some(150));
    }

    #[tokio::test]
    async fn test_overwrite_and_evict() {
        let cache = LruCache::new(3);
        cache.put("a", 1).await;
        cache.put("a", 2).await;
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.get("a").await, Some(2));

        cache.evict("a").await;
        assert_eq!(cache.get("a").await, None);
    }
}
