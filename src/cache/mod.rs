//! Bounded insertion-ordered cache
//!
//! Backs the obfuscator's name caches: once the capacity is reached the
//! oldest entries are evicted. Removal is lazy; stale queue slots are
//! skipped during eviction.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Bounded map evicting in insertion order
pub struct BoundedCache<K: Clone + Eq + Hash, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Clone + Eq + Hash, V> BoundedCache<K, V> {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize) -> Self {
        BoundedCache {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert a value, evicting the oldest entries when full
    pub fn insert(&mut self, key: K, value: V) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
        while self.entries.len() > self.capacity {
            match self.order.pop_front() {
                Some(old) => {
                    self.entries.remove(&old);
                }
                None => break,
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        // the queue slot goes stale and is skipped at eviction time
        self.entries.remove(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
