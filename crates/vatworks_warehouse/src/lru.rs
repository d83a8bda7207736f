//! Bounded least-recently-used registry.

use indexmap::IndexSet;
use std::collections::HashSet;
use std::hash::Hash;
use tracing::warn;

/// Ordered set of keys, least recently used first
///
/// Touching a key moves it to the most recently used end. When a touch
/// pushes the set past its capacity, the least recently used key that is
/// neither pinned nor the key just touched is removed and returned. If every
/// other key is pinned the set is allowed to overflow.
#[derive(Debug, Clone)]
pub struct Lru<K: Hash + Eq> {
    entries: IndexSet<K>,
    pinned: HashSet<K>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone + std::fmt::Debug> Lru<K> {
    /// Create a registry holding at most `capacity` keys
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: IndexSet::new(),
            pinned: HashSet::new(),
            capacity,
        }
    }

    /// Maximum number of keys
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Change the capacity; takes effect on the next touch
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity;
    }

    /// Mark `key` most recently used, returning the key evicted to make room
    pub fn touch(&mut self, key: K) -> Option<K> {
        if let Some(index) = self.entries.get_index_of(&key) {
            let last = self.entries.len() - 1;
            self.entries.move_index(index, last);
            return None;
        }
        self.entries.insert(key.clone());
        if self.entries.len() <= self.capacity {
            return None;
        }
        let victim = self
            .entries
            .iter()
            .find(|k| **k != key && !self.pinned.contains(*k))
            .cloned();
        match victim {
            Some(victim) => {
                self.entries.shift_remove(&victim);
                Some(victim)
            }
            None => {
                warn!(len = self.entries.len(), capacity = self.capacity, "lru over capacity, all entries pinned");
                None
            }
        }
    }

    /// Remove a key, returning whether it was present
    pub fn remove(&mut self, key: &K) -> bool {
        self.pinned.remove(key);
        self.entries.shift_remove(key)
    }

    /// Exempt a key from eviction
    pub fn pin(&mut self, key: K) {
        self.pinned.insert(key);
    }

    /// Make a key evictable again
    pub fn unpin(&mut self, key: &K) {
        self.pinned.remove(key);
    }

    /// Whether a key is pinned
    #[must_use]
    pub fn is_pinned(&self, key: &K) -> bool {
        self.pinned.contains(key)
    }

    /// Whether a key is present
    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys from least to most recently used
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evictions(capacity: usize, touches: &[&'static str]) -> Vec<Option<&'static str>> {
        let mut lru = Lru::new(capacity);
        touches.iter().map(|k| lru.touch(*k)).collect()
    }

    #[test]
    fn test_touch_order_capacity_three() {
        assert_eq!(
            evictions(3, &["v0", "v1", "v2", "v3", "v3", "v2"]),
            vec![None, None, None, Some("v0"), None, None]
        );
    }

    #[test]
    fn test_touch_order_capacity_two() {
        assert_eq!(
            evictions(2, &["v0", "v1", "v2", "v3", "v3", "v2"]),
            vec![None, None, Some("v0"), Some("v1"), None, None]
        );
    }

    #[test]
    fn test_touch_refreshes_recency() {
        let mut lru = Lru::new(2);
        lru.touch("a");
        lru.touch("b");
        lru.touch("a");
        assert_eq!(lru.touch("c"), Some("b"));
        assert_eq!(lru.iter().copied().collect::<Vec<_>>(), vec!["a", "c"]);
    }

    #[test]
    fn test_pinned_skipped() {
        let mut lru = Lru::new(2);
        lru.touch("a");
        lru.pin("a");
        lru.touch("b");
        assert_eq!(lru.touch("c"), Some("b"));
        assert!(lru.contains(&"a"));
    }

    #[test]
    fn test_all_pinned_overflows() {
        let mut lru = Lru::new(1);
        lru.touch("a");
        lru.pin("a");
        assert_eq!(lru.touch("b"), None);
        assert_eq!(lru.len(), 2);
        lru.unpin(&"a");
        assert_eq!(lru.touch("c"), Some("a"));
    }

    #[test]
    fn test_remove() {
        let mut lru = Lru::new(2);
        lru.touch("a");
        lru.pin("a");
        assert!(lru.remove(&"a"));
        assert!(!lru.is_pinned(&"a"));
        assert!(!lru.remove(&"a"));
        assert!(lru.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_bounded_and_evicts_least_recent(
            capacity in 1usize..5,
            touches in proptest::collection::vec(0u8..8, 0..60),
        ) {
            let mut lru = Lru::new(capacity);
            let mut model: Vec<u8> = Vec::new();
            for key in touches {
                let expected = if let Some(pos) = model.iter().position(|k| *k == key) {
                    model.remove(pos);
                    model.push(key);
                    None
                } else {
                    model.push(key);
                    if model.len() > capacity { Some(model.remove(0)) } else { None }
                };
                proptest::prop_assert_eq!(lru.touch(key), expected);
                proptest::prop_assert!(lru.len() <= capacity);
            }
        }
    }
}
