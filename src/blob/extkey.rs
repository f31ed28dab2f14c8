//! Extended-key overflow cache.
//!
//! A key longer than a database's configured key size stores its first
//! bytes inline and the full body in a blob (`IS_EXTENDED`, see
//! SPEC_FULL.md §3). Reading that body on every comparison would be
//! expensive, so resolved bodies are cached here by blob id. No teacher
//! counterpart; grounded on the overflow-key handling implied throughout
//! `original_source/src/btree_key.h` and `btree_find.c`.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::types::BlobId;

/// Simple bounded cache: entries are evicted oldest-first once `capacity` is
/// exceeded, mirroring the cache's own LRU spirit without pulling in a
/// second generic cache implementation for a single-purpose byte cache.
pub struct ExtKeyCache {
    capacity: usize,
    entries: RwLock<HashMap<BlobId, Vec<u8>>>,
    order: RwLock<Vec<BlobId>>,
}

impl ExtKeyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
        }
    }

    pub fn get(&self, id: BlobId) -> Option<Vec<u8>> {
        self.entries.read().get(&id).cloned()
    }

    pub fn insert(&self, id: BlobId, body: Vec<u8>) {
        {
            let mut entries = self.entries.write();
            if entries.len() >= self.capacity && !entries.contains_key(&id) {
                let mut order = self.order.write();
                if let Some(oldest) = order.first().copied() {
                    order.remove(0);
                    entries.remove(&oldest);
                }
            }
            entries.insert(id, body);
        }
        let mut order = self.order.write();
        order.retain(|&x| x != id);
        order.push(id);
    }

    pub fn remove(&self, id: BlobId) {
        self.entries.write().remove(&id);
        self.order.write().retain(|&x| x != id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_get() {
        let cache = ExtKeyCache::new(2);
        cache.insert(BlobId(1), b"abc".to_vec());
        assert_eq!(cache.get(BlobId(1)), Some(b"abc".to_vec()));
    }

    #[test]
    fn evicts_oldest_past_capacity() {
        let cache = ExtKeyCache::new(2);
        cache.insert(BlobId(1), vec![1]);
        cache.insert(BlobId(2), vec![2]);
        cache.insert(BlobId(3), vec![3]);
        assert!(cache.get(BlobId(1)).is_none());
        assert!(cache.get(BlobId(3)).is_some());
    }
}
