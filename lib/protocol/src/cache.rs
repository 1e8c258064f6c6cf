/*
Copyright 2024 The Kubernetes Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    value: V,
    expires_at: Instant,
}

/// A bounded TTL cache with one value type per instance. Inserting an
/// existing key replaces the value and re-arms its TTL. Expired entries are
/// dropped lazily on access and swept when the cache is at capacity.
pub struct TtlCache<K, V> {
    inner: Mutex<HashMap<K, Entry<V>>>,
    capacity: usize,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(capacity: usize) -> Self {
        TtlCache {
            inner: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    pub fn insert(&self, key: K, value: V, ttl: Duration) {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        if map.len() >= self.capacity && !map.contains_key(&key) {
            map.retain(|_, e| e.expires_at > now);
            if map.len() >= self.capacity {
                // still full of live entries, drop the one closest to expiry
                if let Some(k) = map
                    .iter()
                    .min_by_key(|(_, e)| e.expires_at)
                    .map(|(k, _)| k.clone())
                {
                    map.remove(&k);
                }
            }
        }
        map.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        match map.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn remove(&self, key: &K) {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        map.remove(key);
    }

    pub fn len(&self) -> usize {
        let mut map = self.inner.lock().expect("cache lock poisoned");
        let now = Instant::now();
        map.retain(|_, e| e.expires_at > now);
        map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let cache: TtlCache<String, u32> = TtlCache::new(8);
        cache.insert("a".to_string(), 1, Duration::from_secs(60));
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
    }

    #[test]
    fn expired_entry_is_a_miss() {
        let cache: TtlCache<String, u32> = TtlCache::new(8);
        cache.insert("a".to_string(), 1, Duration::from_millis(0));
        assert_eq!(cache.get(&"a".to_string()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn reinsert_replaces_value_and_ttl() {
        let cache: TtlCache<String, u32> = TtlCache::new(8);
        cache.insert("a".to_string(), 1, Duration::from_millis(0));
        cache.insert("a".to_string(), 2, Duration::from_secs(60));
        assert_eq!(cache.get(&"a".to_string()), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn capacity_is_bounded() {
        let cache: TtlCache<u32, u32> = TtlCache::new(4);
        for i in 0..16 {
            cache.insert(i, i, Duration::from_secs(60));
        }
        assert!(cache.len() <= 4);
    }
}
