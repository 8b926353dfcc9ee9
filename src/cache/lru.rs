//! Bounded LRU cache
//!
//! A slab of slots threaded onto an intrusive recency list (`prev`/`next`
//! indices, `SLOT_NONE` sentinel) with a `HashMap` for lookup. Freed slots
//! go on a free list and are reused before the slab grows, so a cache that
//! has reached capacity allocates nothing on further inserts.

use std::collections::HashMap;
use std::hash::Hash;

const SLOT_NONE: usize = usize::MAX;

struct Slot<K, V> {
    entry: Option<(K, V)>,
    prev: usize,
    next: usize,
}

/// A bounded cache evicting the least-recently-used entry when full
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Slot<K, V>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// Create a cache holding at most `capacity` entries (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            map: HashMap::with_capacity(capacity),
            slots: Vec::new(),
            free: Vec::new(),
            head: SLOT_NONE,
            tail: SLOT_NONE,
        }
    }

    /// Maximum number of entries
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of entries
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// True if the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// True if `key` is present; does not promote
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Look up `key`, promoting it to most-recently-used on a hit
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let index = *self.map.get(key)?;
        self.promote(index);
        self.slots[index].entry.as_ref().map(|(_, v)| v)
    }

    /// Insert or replace `key`, promoting it and evicting the
    /// least-recently-used entry if the cache is full
    pub fn insert(&mut self, key: K, value: V) {
        if let Some(&index) = self.map.get(&key) {
            self.slots[index].entry = Some((key, value));
            self.promote(index);
            return;
        }

        if self.map.len() == self.capacity {
            self.evict_tail();
        }

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].entry = Some((key.clone(), value));
                index
            }
            None => {
                self.slots.push(Slot {
                    entry: Some((key.clone(), value)),
                    prev: SLOT_NONE,
                    next: SLOT_NONE,
                });
                self.slots.len() - 1
            }
        };
        self.push_front(index);
        self.map.insert(key, index);
    }

    fn promote(&mut self, index: usize) {
        if self.head == index {
            return;
        }
        self.unlink(index);
        self.push_front(index);
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = (self.slots[index].prev, self.slots[index].next);
        match prev {
            SLOT_NONE => self.head = next,
            _ => self.slots[prev].next = next,
        }
        match next {
            SLOT_NONE => self.tail = prev,
            _ => self.slots[next].prev = prev,
        }
    }

    fn push_front(&mut self, index: usize) {
        self.slots[index].prev = SLOT_NONE;
        self.slots[index].next = self.head;
        match self.head {
            SLOT_NONE => self.tail = index,
            old_head => self.slots[old_head].prev = index,
        }
        self.head = index;
    }

    fn evict_tail(&mut self) {
        let index = self.tail;
        debug_assert_ne!(index, SLOT_NONE);
        self.unlink(index);
        if let Some((key, _)) = self.slots[index].entry.take() {
            self.map.remove(&key);
        }
        self.free.push(index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut cache = LruCache::new(4);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(&1));
        assert_eq!(cache.get(&"missing"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_eviction_is_least_recently_used() {
        let mut cache = LruCache::new(3);
        cache.insert(1, "one");
        cache.insert(2, "two");
        cache.insert(3, "three");
        // touch 1 so 2 becomes the LRU entry
        assert!(cache.get(&1).is_some());
        cache.insert(4, "four");

        assert!(!cache.contains(&2));
        assert!(cache.contains(&1));
        assert!(cache.contains(&3));
        assert!(cache.contains(&4));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn test_first_inserted_evicted_without_touches() {
        let capacity = 8;
        let mut cache = LruCache::new(capacity);
        for i in 0..=capacity {
            cache.insert(i, i);
        }
        assert!(!cache.contains(&0));
        assert_eq!(cache.len(), capacity);
    }

    #[test]
    fn test_replace_promotes() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("a", 10);
        cache.insert("c", 3);

        assert!(!cache.contains(&"b"));
        assert_eq!(cache.get(&"a"), Some(&10));
    }

    #[test]
    fn test_capacity_one() {
        let mut cache = LruCache::new(1);
        cache.insert(1, 1);
        cache.insert(2, 2);
        assert!(!cache.contains(&1));
        assert_eq!(cache.get(&2), Some(&2));
    }

    #[test]
    fn test_slots_are_reused() {
        let mut cache = LruCache::new(2);
        for i in 0..100 {
            cache.insert(i, i);
        }
        // two live slots plus at most one on the free list
        assert!(cache.slots.len() <= 3);
    }
}
