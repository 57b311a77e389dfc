//! Integration tests exercising the trie across the persistence boundary: commit,
//! reopen at a root, structural invariants of the committed tree.
use std::sync::Arc;

use alloy_primitives::keccak256;
use mpt::{Error, MemoryNodeStore, Node, NodeCache, NodeData, NodeRef, NodeStore, Trie, EMPTY_ROOT};

fn entries(count: usize) -> Vec<(Vec<u8>, Vec<u8>)> {
    (0..count)
        .map(|i| {
            let key = keccak256(i.to_be_bytes()).to_vec();
            let value = keccak256(&key).to_vec();
            (key, value)
        })
        .collect()
}

fn load(store: &MemoryNodeStore, node_ref: &NodeRef) -> Node {
    match node_ref {
        NodeRef::Digest(hash) => {
            let rlp = store.get(hash).expect("referenced node missing from store");
            Node::decode(rlp.as_ref()).expect("stored node decodes")
        }
        NodeRef::Bytes(rlp) => Node::decode(rlp).expect("inline node decodes"),
    }
}

/// Walks a committed tree and checks the minimality invariants hold everywhere.
fn check_structure(store: &MemoryNodeStore, node: &Node, is_root: bool) {
    match node.as_data() {
        NodeData::Leaf { .. } => {}
        NodeData::Extension { path, child } => {
            assert!(!path.is_empty(), "extension with an empty path");
            let NodeData::Unknown(child_ref) = child.as_data() else {
                panic!("freshly decoded extension child should be unresolved");
            };
            let child = load(store, child_ref);
            assert!(
                matches!(child.as_data(), NodeData::Branch { .. }),
                "extension child must be a branch"
            );
            check_structure(store, &child, false);
        }
        NodeData::Branch { children, value } => {
            let child_count = children.iter().flatten().count();
            if !is_root {
                assert!(
                    child_count >= 2 || (child_count >= 1 && value.is_some()),
                    "branch without enough structure survived"
                );
            }
            for child in children.iter().flatten() {
                let NodeData::Unknown(child_ref) = child.as_data() else {
                    panic!("freshly decoded branch child should be unresolved");
                };
                check_structure(store, &load(store, child_ref), false);
            }
        }
        NodeData::Unknown(node_ref) => check_structure(store, &load(store, node_ref), is_root),
    }
}

#[test]
fn test_commit_and_reopen() -> Result<(), Error> {
    let store = Arc::new(MemoryNodeStore::new());
    let entries = entries(64);

    let mut trie = Trie::empty(store.clone());
    for (key, value) in &entries {
        trie.set(key, value)?;
    }
    let expected_root = trie.update_root_hash();
    trie.commit()?;
    assert_eq!(trie.root_hash(), expected_root);
    assert!(store.contains(&expected_root));

    // every key resolves through the store in a fresh trie
    let mut reopened = Trie::new(store.clone(), expected_root);
    for (key, value) in &entries {
        assert_eq!(reopened.get(key)?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(value.as_slice()));
    }
    assert_eq!(reopened.get(b"absent")?, None);

    Ok(())
}

#[test]
fn test_committed_tree_invariants() -> Result<(), Error> {
    let store = Arc::new(MemoryNodeStore::new());
    let mut trie = Trie::empty(store.clone());

    for (key, value) in entries(96) {
        trie.set(&key, &value)?;
    }
    // variable-length keys force branch values into the structure
    trie.set(b"do", b"verb")?;
    trie.set(b"dog", b"puppy")?;
    trie.set(b"doge", b"coin")?;
    // and a few deletions force collapses
    for (key, _) in entries(96).iter().take(40) {
        trie.delete(key)?;
    }
    trie.commit()?;

    let root = load(&store, &NodeRef::Digest(trie.root_hash()));
    check_structure(&store, &root, true);

    Ok(())
}

#[test]
fn test_commit_across_mutations() -> Result<(), Error> {
    let store = Arc::new(MemoryNodeStore::new());
    let entries = entries(32);

    let mut trie = Trie::empty(store.clone());
    for (key, value) in &entries {
        trie.set(key, value)?;
    }
    trie.commit()?;
    let first_root = trie.root_hash();

    // mutate the committed tree: the lazy root re-resolves from the store
    for (key, _) in entries.iter().take(8) {
        trie.delete(key)?;
    }
    trie.set(b"fresh", b"value")?;
    trie.commit()?;
    let second_root = trie.root_hash();
    assert_ne!(first_root, second_root);

    let mut reopened = Trie::new(store.clone(), second_root);
    assert_eq!(reopened.get(&entries[0].0)?, None);
    assert_eq!(reopened.get(&entries[9].0)?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(entries[9].1.as_slice()));
    assert_eq!(reopened.get(b"fresh")?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(b"value".as_ref()));

    // nothing is pruned: the first root still answers
    let mut old = Trie::new(store, first_root);
    assert_eq!(old.get(&entries[0].0)?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(entries[0].1.as_slice()));
    assert_eq!(old.get(b"fresh")?, None);

    Ok(())
}

#[test]
fn test_parallel_commit_matches_serial_hash() -> Result<(), Error> {
    let store = Arc::new(MemoryNodeStore::new());
    let entries = entries(128);

    // keccak keys spread across all 16 root slots, well past the fan-out threshold
    let mut trie = Trie::empty(store.clone());
    for (key, value) in &entries {
        trie.set(key, value)?;
    }
    trie.commit()?;

    let mut reference = Trie::empty(Arc::new(MemoryNodeStore::new()));
    for (key, value) in &entries {
        reference.set(key, value)?;
    }
    assert_eq!(trie.root_hash(), reference.update_root_hash());

    // every subtree flushed by the workers is reachable
    let mut reopened = Trie::new(store, trie.root_hash());
    for (key, value) in &entries {
        assert_eq!(reopened.get(key)?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(value.as_slice()));
    }

    Ok(())
}

#[test]
fn test_short_root_is_persisted() -> Result<(), Error> {
    let store = Arc::new(MemoryNodeStore::new());
    let mut trie = Trie::empty(store.clone());

    // a single tiny leaf encodes in under 32 bytes, yet must be reachable by hash
    trie.set(b"a", b"1")?;
    trie.commit()?;

    let mut reopened = Trie::new(store, trie.root_hash());
    assert_eq!(reopened.get(b"a")?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(b"1".as_ref()));

    Ok(())
}

#[test]
fn test_commit_empty_trie() -> Result<(), Error> {
    let store = Arc::new(MemoryNodeStore::new());
    let mut trie = Trie::empty(store.clone());
    trie.commit()?;
    assert_eq!(trie.root_hash(), EMPTY_ROOT);
    assert!(store.is_empty());

    // deleting the last key commits back to the empty root
    trie.set(b"only", b"key")?;
    trie.commit()?;
    trie.delete(b"only")?;
    trie.commit()?;
    assert_eq!(trie.root_hash(), EMPTY_ROOT);

    Ok(())
}

#[test]
fn test_update_root_hash_matches_commit() -> Result<(), Error> {
    let store = Arc::new(MemoryNodeStore::new());
    let mut trie = Trie::empty(store);

    for (key, value) in entries(48) {
        trie.set(&key, &value)?;
    }
    let computed = trie.update_root_hash();
    trie.commit()?;
    assert_eq!(trie.root_hash(), computed);

    // the in-memory tree was dropped at commit; reads resolve from the store again
    let (key, value) = &entries(48)[17];
    assert_eq!(trie.get(key)?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(value.as_slice()));

    Ok(())
}

#[test]
fn test_set_root_hash_switches_contents() -> Result<(), Error> {
    let store = Arc::new(MemoryNodeStore::new());
    let mut trie = Trie::empty(store);

    trie.set(b"first", b"state")?;
    trie.commit()?;
    let first_root = trie.root_hash();

    trie.set(b"second", b"state")?;
    trie.delete(b"first")?;
    trie.commit()?;
    let second_root = trie.root_hash();

    trie.set_root_hash(first_root);
    assert_eq!(trie.root_hash(), first_root);
    assert_eq!(trie.get(b"first")?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(b"state".as_ref()));
    assert_eq!(trie.get(b"second")?, None);

    trie.set_root_hash(second_root);
    assert_eq!(trie.get(b"first")?, None);
    assert_eq!(trie.get(b"second")?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(b"state".as_ref()));

    Ok(())
}

#[test]
fn test_missing_node_surfaces() -> Result<(), Error> {
    let populated = Arc::new(MemoryNodeStore::new());
    let mut trie = Trie::empty(populated);
    for (key, value) in entries(16) {
        trie.set(&key, &value)?;
    }
    trie.commit()?;

    // the root is not resolvable in an unrelated store
    let mut detached = Trie::new(Arc::new(MemoryNodeStore::new()), trie.root_hash());
    let err = detached.get(&entries(16)[0].0).unwrap_err();
    assert!(matches!(err, Error::MissingNode(hash) if hash == trie.root_hash()));

    Ok(())
}

#[test]
fn test_shared_node_cache() -> Result<(), Error> {
    let store = Arc::new(MemoryNodeStore::new());
    let cache = Arc::new(NodeCache::new(256));

    let mut writer = Trie::with_node_cache(store.clone(), EMPTY_ROOT, cache.clone());
    for (key, value) in entries(32) {
        writer.set(&key, &value)?;
    }
    writer.commit()?;
    // commit writes through to the shared cache
    assert!(!cache.is_empty());

    let mut reader = Trie::with_node_cache(store, writer.root_hash(), cache);
    for (key, value) in entries(32) {
        assert_eq!(reader.get(&key)?.as_ref().map(alloy_primitives::Bytes::as_ref), Some(value.as_slice()));
    }

    Ok(())
}
