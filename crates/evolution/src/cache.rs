//! Bounded cache of loaded artifacts.
//!
//! Entries live in a fixed-size arena; a key index points into it. When the
//! arena is full the least recently used slot is overwritten in place.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

#[derive(Debug)]
struct Slot<V> {
    key: String,
    value: Arc<V>,
    last_used: u64,
}

/// LRU cache with a fixed capacity.
#[derive(Debug)]
pub struct ArtifactCache<V> {
    slots: Vec<Slot<V>>,
    index: HashMap<String, usize>,
    capacity: NonZeroUsize,
    tick: u64,
}

impl<V> ArtifactCache<V> {
    /// Create an empty cache holding at most `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity.get()),
            index: HashMap::with_capacity(capacity.get()),
            capacity,
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Look up `key`, marking it recently used.
    pub fn get(&mut self, key: &str) -> Option<Arc<V>> {
        let slot = *self.index.get(key)?;
        let tick = self.next_tick();
        let entry = &mut self.slots[slot];
        entry.last_used = tick;
        Some(entry.value.clone())
    }

    /// Insert or replace `key`. Returns the evicted entry, if any.
    pub fn insert(&mut self, key: impl Into<String>, value: V) -> Option<(String, Arc<V>)> {
        let key = key.into();
        let tick = self.next_tick();
        let value = Arc::new(value);

        if let Some(&slot) = self.index.get(&key) {
            let entry = &mut self.slots[slot];
            entry.value = value;
            entry.last_used = tick;
            return None;
        }

        if self.slots.len() < self.capacity.get() {
            self.index.insert(key.clone(), self.slots.len());
            self.slots.push(Slot { key, value, last_used: tick });
            return None;
        }

        let victim = self
            .slots
            .iter()
            .enumerate()
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i)?;
        let old = std::mem::replace(&mut self.slots[victim], Slot { key: key.clone(), value, last_used: tick });
        self.index.remove(&old.key);
        self.index.insert(key, victim);
        Some((old.key, old.value))
    }

    /// Drop `key` from the cache.
    pub fn remove(&mut self, key: &str) -> Option<Arc<V>> {
        let slot = self.index.remove(key)?;
        let removed = self.slots.swap_remove(slot);
        if let Some(moved) = self.slots.get(slot) {
            self.index.insert(moved.key.clone(), slot);
        }
        Some(removed.value)
    }

    /// Entries currently held.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Maximum entries.
    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(n: usize) -> ArtifactCache<String> {
        ArtifactCache::new(NonZeroUsize::new(n).unwrap())
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut c = cache(2);
        c.insert("a", "1".to_string());
        c.insert("b", "2".to_string());
        assert!(c.get("a").is_some());

        let evicted = c.insert("c", "3".to_string()).unwrap();
        assert_eq!(evicted.0, "b");
        assert_eq!(c.len(), 2);
        assert!(c.get("b").is_none());
        assert_eq!(c.get("c").as_deref().map(String::as_str), Some("3"));
    }

    #[test]
    fn test_replace_does_not_grow() {
        let mut c = cache(2);
        c.insert("a", "1".to_string());
        assert!(c.insert("a", "2".to_string()).is_none());
        assert_eq!(c.len(), 1);
        assert_eq!(c.get("a").as_deref().map(String::as_str), Some("2"));
    }

    #[test]
    fn test_remove_keeps_index_consistent() {
        let mut c = cache(3);
        c.insert("a", "1".to_string());
        c.insert("b", "2".to_string());
        c.insert("c", "3".to_string());
        assert!(c.remove("a").is_some());
        assert!(c.remove("a").is_none());
        assert_eq!(c.get("c").as_deref().map(String::as_str), Some("3"));
        assert_eq!(c.get("b").as_deref().map(String::as_str), Some("2"));
        assert_eq!(c.len(), 2);
    }
}
