//! Content-addressed backing store for trie nodes.
use std::sync::RwLock;

use alloy_primitives::{
    map::{FbBuildHasher, HashMap},
    Bytes, B256,
};

/// Hash-keyed map specialized for 32-byte keys.
pub type B256Map<V> = HashMap<B256, V, FbBuildHasher<32>>;

/// A byte-addressed node store keyed by Keccak-256 digest.
///
/// The store is content-addressed: for every pair the trie writes,
/// `hash == keccak256(rlp)`. `set` must tolerate concurrent calls; the commit
/// protocol may flush from multiple workers.
pub trait NodeStore: Send + Sync {
    /// Returns the RLP encoding of the node with the given hash, if present.
    fn get(&self, hash: &B256) -> Option<Bytes>;

    /// Persists the RLP encoding of a node under its hash.
    fn set(&self, hash: B256, rlp: Bytes);
}

/// In-memory reference implementation of [`NodeStore`].
#[derive(Debug, Default)]
pub struct MemoryNodeStore {
    nodes: RwLock<B256Map<Bytes>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored nodes.
    pub fn len(&self) -> usize {
        self.nodes.read().expect("node store lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, hash: &B256) -> bool {
        self.nodes.read().expect("node store lock poisoned").contains_key(hash)
    }
}

impl NodeStore for MemoryNodeStore {
    fn get(&self, hash: &B256) -> Option<Bytes> {
        self.nodes.read().expect("node store lock poisoned").get(hash).cloned()
    }

    fn set(&self, hash: B256, rlp: Bytes) {
        self.nodes.write().expect("node store lock poisoned").insert(hash, rlp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::keccak256;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryNodeStore::new();
        assert!(store.is_empty());

        let rlp = Bytes::from(vec![0xc2, 0x80, 0x80]);
        let hash = keccak256(&rlp);
        store.set(hash, rlp.clone());

        assert_eq!(store.len(), 1);
        assert!(store.contains(&hash));
        assert_eq!(store.get(&hash), Some(rlp));
        assert_eq!(store.get(&keccak256([0u8])), None);
    }
}
