//! Fixed-capacity shared hash table, the host counterpart of a BPF hash map

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Concurrent table that refuses new keys once `capacity` keys exist.
/// Overwriting an existing key always succeeds.
pub struct BoundedTable<V> {
    inner: DashMap<u32, V>,
    len: AtomicUsize,
    capacity: usize,
}

impl<V: Copy> BoundedTable<V> {
    pub fn new(capacity: u32) -> Self {
        Self {
            inner: DashMap::new(),
            len: AtomicUsize::new(0),
            capacity: capacity as usize,
        }
    }

    pub fn get(&self, key: u32) -> Option<V> {
        self.inner.get(&key).map(|r| *r)
    }

    /// Update an existing value in place. Returns false if the key is absent.
    pub fn update<F: FnOnce(&mut V)>(&self, key: u32, f: F) -> bool {
        match self.inner.get_mut(&key) {
            Some(mut value) => {
                f(value.value_mut());
                true
            }
            None => false,
        }
    }

    /// Create or overwrite. Returns false when the key is new and the table is
    /// full.
    pub fn insert(&self, key: u32, value: V) -> bool {
        match self.inner.entry(key) {
            Entry::Occupied(mut entry) => {
                entry.insert(value);
                true
            }
            Entry::Vacant(entry) => {
                if self.len.fetch_add(1, Ordering::AcqRel) >= self.capacity {
                    self.len.fetch_sub(1, Ordering::AcqRel);
                    return false;
                }
                entry.insert(value);
                true
            }
        }
    }

    pub fn remove(&self, key: u32) -> Option<V> {
        let removed = self.inner.remove(&key).map(|(_, v)| v);
        if removed.is_some() {
            self.len.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Every entry, in no particular order
    pub fn entries(&self) -> Vec<(u32, V)> {
        self.inner.iter().map(|r| (*r.key(), *r.value())).collect()
    }
}
