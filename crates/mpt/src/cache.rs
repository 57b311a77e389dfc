//! Bounded caches accelerating node resolution and point lookups.
//!
//! Both caches are best-effort: a miss is indistinguishable from a hit followed by
//! recomputation, so eviction and lock poisoning never affect trie semantics.
use std::num::NonZeroUsize;
use std::sync::Mutex;

use alloy_primitives::{Bytes, B256};
use lru::LruCache;

use crate::node::Node;

/// Default capacity of the decoded-node cache.
pub const DEFAULT_NODE_CACHE_CAPACITY: usize = 4096;

/// Default capacity of a trie's value cache.
pub(crate) const DEFAULT_VALUE_CACHE_CAPACITY: usize = 1024;

/// Shared LRU cache of decoded nodes keyed by their Keccak-256 digest.
///
/// Filled on resolution and written through on commit. Safe to share between tries:
/// a digest identifies its node content globally.
#[derive(Debug)]
pub struct NodeCache {
    inner: Mutex<LruCache<B256, Node>>,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self { inner: Mutex::new(LruCache::new(capacity)) }
    }

    pub(crate) fn get(&self, hash: &B256) -> Option<Node> {
        self.inner.lock().ok()?.get(hash).cloned()
    }

    pub(crate) fn put(&self, hash: B256, node: Node) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(hash, node);
        }
    }

    /// Number of cached nodes.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new(DEFAULT_NODE_CACHE_CAPACITY)
    }
}

/// Per-trie LRU cache of raw values keyed by the lookup key.
///
/// Writes evict the affected key before the trie is touched, so a stale value can
/// never be observed.
#[derive(Debug)]
pub(crate) struct ValueCache {
    inner: LruCache<Vec<u8>, Bytes>,
}

impl ValueCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).expect("capacity clamped to >= 1");
        Self { inner: LruCache::new(capacity) }
    }

    pub(crate) fn get(&mut self, key: &[u8]) -> Option<&Bytes> {
        self.inner.get(key)
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Bytes) {
        self.inner.put(key, value);
    }

    pub(crate) fn remove(&mut self, key: &[u8]) {
        self.inner.pop(key);
    }

    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }
}
