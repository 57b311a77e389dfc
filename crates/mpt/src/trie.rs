//! Store-backed Merkle Patricia Trie.
//!
//! The trie keeps the mutated part of the tree in memory as owned nodes and leaves
//! everything else in the backing store, reachable through [`NodeData::Unknown`]
//! placeholders that resolve on demand. Writes descend iteratively, dismantling the
//! ancestors along the lookup path onto a per-operation stack; the rewrite pass
//! (`connect_nodes`) then walks that stack bottom-up, rebuilding each ancestor around
//! the changed child and collapsing redundant structure so the minimality invariants
//! hold after every mutation. `commit` seals the dirty subtree bottom-up and flushes
//! every hash-referenced node to the store.
use std::cell::RefCell;
use std::sync::Arc;

use alloy_primitives::{b256, keccak256, Bytes, B256};
use alloy_rlp::Encodable;
use rayon::prelude::*;

use crate::cache::{NodeCache, ValueCache, DEFAULT_VALUE_CACHE_CAPACITY};
use crate::hp::{bytes_to_nibbles, common_prefix_len, Nibbles};
use crate::node::{Node, NodeData, NodeRef};
use crate::store::NodeStore;

/// Root hash published for a trie with no entries: the Keccak-256 digest of the
/// RLP encoding of the empty byte string.
pub const EMPTY_ROOT: B256 =
    b256!("56e81f171bcc55a6ff8345e692c0f86e5b48e01b996cadc001622fb5e363b421");

/// Minimum number of dirty root children before commit fans out across workers.
const PARALLEL_COMMIT_THRESHOLD: usize = 4;

/// Failure modes of trie operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The store has no entry for a referenced hash.
    #[error("missing trie node: {0:#}")]
    MissingNode(B256),
    /// RLP or hex-prefix decoding produced an impossible node shape.
    #[error("malformed trie node: {0}")]
    MalformedNode(&'static str),
    /// Low-level RLP parse failure.
    #[error("rlp decode error: {0}")]
    Rlp(#[from] alloy_rlp::Error),
    /// Strict delete of a key that is not in the trie; the path is in nibbles.
    #[error("delete of a missing key at nibble path {0:02x?}")]
    MissingDeleteKey(Vec<u8>),
    /// The in-memory tree broke a structural invariant; indicates a bug.
    #[error("trie structure violated: {0}")]
    StructuralInvariantViolation(&'static str),
    /// One or more parallel commit workers failed.
    #[error("parallel commit failed with {} error(s)", .0.len())]
    CommitAggregate(Vec<Error>),
}

/// An ancestor dismantled during descent, waiting to be rebuilt around the new child.
///
/// `dirty` and `cached` preserve the original node state so that no-op traversals can
/// reassemble the spine without invalidating anything.
enum Ancestor {
    Branch {
        children: [Option<Box<Node>>; 16],
        value: Option<Vec<u8>>,
        index: u8,
        dirty: bool,
        cached: Option<NodeRef>,
    },
    Extension {
        path: Nibbles,
        dirty: bool,
        cached: Option<NodeRef>,
    },
}

/// Authenticated key/value map over a content-addressed node store.
pub struct Trie<S> {
    store: Arc<S>,
    node_cache: Arc<NodeCache>,
    value_cache: ValueCache,
    root: Option<Box<Node>>,
    root_hash: B256,
}

impl<S> std::fmt::Debug for Trie<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trie")
            .field("root_hash", &self.root_hash)
            .field("dirty", &self.root.as_ref().is_some_and(|root| root.dirty))
            .finish()
    }
}

impl<S: NodeStore> Trie<S> {
    /// Opens a trie at the given root. The tree contents materialize lazily from the
    /// store as they are traversed.
    pub fn new(store: Arc<S>, root_hash: B256) -> Self {
        Self::with_node_cache(store, root_hash, Arc::new(NodeCache::default()))
    }

    /// Creates an empty trie.
    pub fn empty(store: Arc<S>) -> Self {
        Self::new(store, EMPTY_ROOT)
    }

    /// Opens a trie that shares a decoded-node cache with other tries over the same
    /// store.
    pub fn with_node_cache(store: Arc<S>, root_hash: B256, node_cache: Arc<NodeCache>) -> Self {
        let mut trie = Self {
            store,
            node_cache,
            value_cache: ValueCache::new(DEFAULT_VALUE_CACHE_CAPACITY),
            root: None,
            root_hash: EMPTY_ROOT,
        };
        trie.set_root_hash(root_hash);
        trie
    }

    /// The backing store this trie reads from and commits to.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// The last published root hash. Stale while uncommitted mutations are pending;
    /// refresh with [`Trie::update_root_hash`] or [`Trie::commit`].
    #[inline]
    pub fn root_hash(&self) -> B256 {
        self.root_hash
    }

    /// Replaces the tree contents with whatever is reachable from `root_hash` through
    /// the store. Pending uncommitted state is discarded.
    pub fn set_root_hash(&mut self, root_hash: B256) {
        self.value_cache.clear();
        if root_hash == EMPTY_ROOT || root_hash == B256::ZERO {
            self.root = None;
            self.root_hash = EMPTY_ROOT;
        } else {
            self.root = Some(Box::new(Node::from_ref(NodeRef::Digest(root_hash))));
            self.root_hash = root_hash;
        }
    }

    /// Whether the in-memory tree is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    /// Retrieves the value associated with a given key in the trie.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, Error> {
        if let Some(value) = self.value_cache.get(key) {
            return Ok(Some(value.clone()));
        }
        let nibbles = bytes_to_nibbles(key);
        let Some(root) = self.root.as_mut() else {
            return Ok(None);
        };
        let found = lookup(root, &nibbles, 0, self.store.as_ref(), &self.node_cache)?;
        if let Some(value) = &found {
            self.value_cache.put(key.to_vec(), value.clone());
        }
        Ok(found)
    }

    /// Retrieves the RLP-decoded value corresponding to the key.
    pub fn get_rlp<T: alloy_rlp::Decodable>(&mut self, key: &[u8]) -> Result<Option<T>, Error> {
        match self.get(key)? {
            Some(bytes) => {
                let mut slice = bytes.as_ref();
                Ok(Some(T::decode(&mut slice)?))
            }
            None => Ok(None),
        }
    }

    /// Inserts a key-value pair into the trie. An empty value deletes the key.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.value_cache.remove(key);
        let nibbles = bytes_to_nibbles(key);
        let new_value = (!value.is_empty()).then(|| value.to_vec());
        self.run(&nibbles, new_value, true)
    }

    /// Inserts an RLP-encoded value into the trie.
    pub fn set_rlp(&mut self, key: &[u8], value: impl Encodable) -> Result<(), Error> {
        let mut rlp = Vec::new();
        value.encode(&mut rlp);
        self.value_cache.remove(key);
        let nibbles = bytes_to_nibbles(key);
        self.run(&nibbles, Some(rlp), true)
    }

    /// Removes a key from the trie. Deleting an absent key is a no-op.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.value_cache.remove(key);
        let nibbles = bytes_to_nibbles(key);
        self.run(&nibbles, None, true)
    }

    /// Removes a key from the trie, failing with [`Error::MissingDeleteKey`] if the
    /// key is not present. The trie is left unchanged on that error.
    pub fn strict_delete(&mut self, key: &[u8]) -> Result<(), Error> {
        self.value_cache.remove(key);
        let nibbles = bytes_to_nibbles(key);
        self.run(&nibbles, None, false)
    }

    /// Computes and publishes the root hash without persisting anything.
    ///
    /// Dirty state stays dirty; a later [`Trie::commit`] still flushes it.
    pub fn update_root_hash(&mut self) -> B256 {
        self.root_hash = match &self.root {
            None => EMPTY_ROOT,
            Some(root) => root.hash(),
        };
        self.root_hash
    }

    /// Flushes the dirty subtree into the backing store and publishes the new root.
    ///
    /// Nodes are sealed in post-order, children before parents, so that every parent
    /// embeds its children's final references. When the root is a branch with at
    /// least [`PARALLEL_COMMIT_THRESHOLD`] dirty children the subtrees seal on worker
    /// threads; each subtree owns a disjoint node set, and all store writes happen
    /// afterwards on the calling thread. After a successful commit the in-memory tree
    /// is dropped and the root is retained as a lazy placeholder.
    pub fn commit(&mut self) -> Result<(), Error> {
        let Some(root) = self.root.as_mut() else {
            self.root_hash = EMPTY_ROOT;
            return Ok(());
        };
        if !root.dirty {
            self.root_hash = root.hash();
            return Ok(());
        }

        let mut batch: Vec<(B256, Vec<u8>)> = Vec::new();
        if let NodeData::Branch { children, .. } = &mut root.data {
            let dirty_children = children.iter().flatten().filter(|child| child.dirty).count();
            if dirty_children >= PARALLEL_COMMIT_THRESHOLD {
                let results: Vec<Result<Vec<(B256, Vec<u8>)>, Error>> = children
                    .as_mut_slice()
                    .par_iter_mut()
                    .filter_map(|slot| slot.as_deref_mut())
                    .filter(|child| child.dirty)
                    .map(|child| {
                        let mut subtree_batch = Vec::new();
                        seal(child, &mut subtree_batch).map(|()| subtree_batch)
                    })
                    .collect();

                let mut failures = Vec::new();
                for result in results {
                    match result {
                        Ok(mut subtree_batch) => batch.append(&mut subtree_batch),
                        Err(err) => failures.push(err),
                    }
                }
                if !failures.is_empty() {
                    return Err(Error::CommitAggregate(failures));
                }
            }
        }
        seal(root, &mut batch)?;

        let root_hash = match root.reference() {
            NodeRef::Digest(digest) => digest,
            NodeRef::Bytes(bytes) => {
                // short roots are persisted too, keyed by the hash of their encoding
                let digest = keccak256(&bytes);
                batch.push((digest, bytes));
                digest
            }
        };

        tracing::debug!(nodes = batch.len(), root = %root_hash, "committing trie");
        for (hash, rlp) in batch {
            if let Ok(node) = Node::decode(&rlp) {
                self.node_cache.put(hash, node);
            }
            self.store.set(hash, Bytes::from(rlp));
        }

        self.root_hash = root_hash;
        self.root = Some(Box::new(Node::from_ref(NodeRef::Digest(root_hash))));
        Ok(())
    }

    /// Renders the resolved part of the tree, for debugging.
    pub fn dump(&self) -> String {
        use core::fmt::Write;

        fn walk(node: &Node, depth: usize, out: &mut String) {
            let indent = "  ".repeat(depth);
            match node.as_data() {
                NodeData::Leaf { path, value } => {
                    let _ = writeln!(
                        out,
                        "{indent}Leaf path={:x?} value_len={}",
                        path.as_slice(),
                        value.len()
                    );
                }
                NodeData::Extension { path, child } => {
                    let _ = writeln!(out, "{indent}Extension path={:x?}", path.as_slice());
                    walk(child, depth + 1, out);
                }
                NodeData::Branch { children, value } => {
                    let _ = writeln!(out, "{indent}Branch value_len={:?}", value.as_ref().map(Vec::len));
                    for (i, child) in children.iter().enumerate() {
                        if let Some(child) = child {
                            let _ = writeln!(out, "{indent}  [{i:x}]:");
                            walk(child, depth + 2, out);
                        }
                    }
                }
                NodeData::Unknown(node_ref) => {
                    let _ = writeln!(out, "{indent}{node_ref}");
                }
            }
        }

        match &self.root {
            None => "Null\n".to_string(),
            Some(root) => {
                let mut out = String::new();
                walk(root, 0, &mut out);
                out
            }
        }
    }
}

// The write engine.
impl<S: NodeStore> Trie<S> {
    /// Unified write core: descends along `path`, dismantling the ancestors onto a
    /// local stack, then rebuilds bottom-up. `new_value` of `None` deletes.
    fn run(
        &mut self,
        path: &[u8],
        new_value: Option<Vec<u8>>,
        ignore_missing_delete: bool,
    ) -> Result<(), Error> {
        let Some(mut current) = self.root.take() else {
            if let Some(value) = new_value {
                self.root = Some(Box::new(Node::dirty(NodeData::Leaf {
                    path: Nibbles::from_slice(path),
                    value,
                })));
            }
            return Ok(());
        };

        let mut stack: Vec<Ancestor> = Vec::new();
        let mut cursor = 0usize;

        loop {
            current.resolve(self.store.as_ref(), &self.node_cache)?;
            let Node { data, cached_reference, dirty } = *current;

            match data {
                NodeData::Branch { mut children, value } => {
                    if cursor == path.len() {
                        // the key terminates on this branch
                        return match new_value {
                            None if value.is_none() => {
                                // no value terminates on this branch; not a missing
                                // key even for strict deletes
                                let node =
                                    Node { data: NodeData::Branch { children, value }, cached_reference, dirty };
                                self.root = unwind(stack, Some(Box::new(node)));
                                Ok(())
                            }
                            None => {
                                let next = self.rebuild_branch(children, None)?;
                                self.root = self.connect_nodes(next, stack)?;
                                Ok(())
                            }
                            Some(value_new) if value.as_deref() == Some(value_new.as_slice()) => {
                                let node =
                                    Node { data: NodeData::Branch { children, value }, cached_reference, dirty };
                                self.root = unwind(stack, Some(Box::new(node)));
                                Ok(())
                            }
                            Some(value_new) => {
                                let next = Node::dirty(NodeData::Branch {
                                    children,
                                    value: Some(value_new),
                                });
                                self.root = self.connect_nodes(Some(Box::new(next)), stack)?;
                                Ok(())
                            }
                        };
                    }

                    let index = path[cursor] as usize;
                    cursor += 1;
                    let child = children[index].take();
                    stack.push(Ancestor::Branch {
                        children,
                        value,
                        index: index as u8,
                        dirty,
                        cached: cached_reference.into_inner(),
                    });
                    match child {
                        Some(node) => current = node,
                        None => {
                            return match new_value {
                                Some(value) => {
                                    let leaf = Node::dirty(NodeData::Leaf {
                                        path: Nibbles::from_slice(&path[cursor..]),
                                        value,
                                    });
                                    self.root =
                                        self.connect_nodes(Some(Box::new(leaf)), stack)?;
                                    Ok(())
                                }
                                None => self.finish_missing_delete(
                                    stack,
                                    None,
                                    path,
                                    ignore_missing_delete,
                                ),
                            };
                        }
                    }
                }

                NodeData::Extension { path: ext_path, child } => {
                    let remaining = &path[cursor..];
                    let common_len = common_prefix_len(&ext_path, remaining);
                    if common_len == ext_path.len() {
                        cursor += common_len;
                        stack.push(Ancestor::Extension {
                            path: ext_path,
                            dirty,
                            cached: cached_reference.into_inner(),
                        });
                        current = child;
                        continue;
                    }

                    // the key diverges inside the extension path
                    return match new_value {
                        None => {
                            let node = Node {
                                data: NodeData::Extension { path: ext_path, child },
                                cached_reference,
                                dirty,
                            };
                            self.finish_missing_delete(
                                stack,
                                Some(Box::new(node)),
                                path,
                                ignore_missing_delete,
                            )
                        }
                        Some(value) => {
                            let split = common_len + 1;
                            let mut children: [Option<Box<Node>>; 16] = Default::default();
                            children[ext_path[common_len] as usize] =
                                Some(if ext_path.len() > split {
                                    Box::new(Node::dirty(NodeData::Extension {
                                        path: Nibbles::from_slice(&ext_path[split..]),
                                        child,
                                    }))
                                } else {
                                    child
                                });
                            let branch_value = if common_len == remaining.len() {
                                Some(value)
                            } else {
                                children[remaining[common_len] as usize] =
                                    Some(Box::new(Node::dirty(NodeData::Leaf {
                                        path: Nibbles::from_slice(&remaining[split..]),
                                        value,
                                    })));
                                None
                            };
                            if common_len > 0 {
                                stack.push(Ancestor::Extension {
                                    path: Nibbles::from_slice(&ext_path[..common_len]),
                                    dirty: true,
                                    cached: None,
                                });
                            }
                            let branch =
                                Node::dirty(NodeData::Branch { children, value: branch_value });
                            self.root = self.connect_nodes(Some(Box::new(branch)), stack)?;
                            Ok(())
                        }
                    };
                }

                NodeData::Leaf { path: leaf_path, value: leaf_value } => {
                    let remaining = &path[cursor..];
                    let common_len = common_prefix_len(&leaf_path, remaining);

                    if common_len == leaf_path.len() && common_len == remaining.len() {
                        // the key terminates exactly on this leaf
                        return match new_value {
                            None => {
                                self.root = self.connect_nodes(None, stack)?;
                                Ok(())
                            }
                            Some(value) if leaf_value == value => {
                                let node = Node {
                                    data: NodeData::Leaf { path: leaf_path, value: leaf_value },
                                    cached_reference,
                                    dirty,
                                };
                                self.root = unwind(stack, Some(Box::new(node)));
                                Ok(())
                            }
                            Some(value) => {
                                let leaf =
                                    Node::dirty(NodeData::Leaf { path: leaf_path, value });
                                self.root = self.connect_nodes(Some(Box::new(leaf)), stack)?;
                                Ok(())
                            }
                        };
                    }

                    return match new_value {
                        None => {
                            let node = Node {
                                data: NodeData::Leaf { path: leaf_path, value: leaf_value },
                                cached_reference,
                                dirty,
                            };
                            self.finish_missing_delete(
                                stack,
                                Some(Box::new(node)),
                                path,
                                ignore_missing_delete,
                            )
                        }
                        Some(value) => {
                            let split = common_len + 1;
                            let mut children: [Option<Box<Node>>; 16] = Default::default();
                            let mut branch_value = None;
                            // exactly one side carries the new value; the side that
                            // outlives the divergence point lands in its slot through
                            // connect_nodes
                            let (final_index, final_leaf) = if common_len == remaining.len() {
                                branch_value = Some(value);
                                (
                                    leaf_path[common_len],
                                    Node::dirty(NodeData::Leaf {
                                        path: Nibbles::from_slice(&leaf_path[split..]),
                                        value: leaf_value,
                                    }),
                                )
                            } else if common_len == leaf_path.len() {
                                branch_value = Some(leaf_value);
                                (
                                    remaining[common_len],
                                    Node::dirty(NodeData::Leaf {
                                        path: Nibbles::from_slice(&remaining[split..]),
                                        value,
                                    }),
                                )
                            } else {
                                children[leaf_path[common_len] as usize] =
                                    Some(Box::new(Node::dirty(NodeData::Leaf {
                                        path: Nibbles::from_slice(&leaf_path[split..]),
                                        value: leaf_value,
                                    })));
                                (
                                    remaining[common_len],
                                    Node::dirty(NodeData::Leaf {
                                        path: Nibbles::from_slice(&remaining[split..]),
                                        value,
                                    }),
                                )
                            };
                            if common_len > 0 {
                                stack.push(Ancestor::Extension {
                                    path: Nibbles::from_slice(&remaining[..common_len]),
                                    dirty: true,
                                    cached: None,
                                });
                            }
                            stack.push(Ancestor::Branch {
                                children,
                                value: branch_value,
                                index: final_index,
                                dirty: true,
                                cached: None,
                            });
                            self.root = self.connect_nodes(Some(Box::new(final_leaf)), stack)?;
                            Ok(())
                        }
                    };
                }

                NodeData::Unknown(_) => {
                    return Err(Error::StructuralInvariantViolation(
                        "unresolved node after resolve",
                    ));
                }
            }
        }
    }

    /// Reassembles the spine and reports the missing key according to the flag.
    fn finish_missing_delete(
        &mut self,
        stack: Vec<Ancestor>,
        current: Option<Box<Node>>,
        path: &[u8],
        ignore_missing_delete: bool,
    ) -> Result<(), Error> {
        self.root = unwind(stack, current);
        if ignore_missing_delete {
            Ok(())
        } else {
            Err(Error::MissingDeleteKey(path.to_vec()))
        }
    }

    /// Walks the ancestor stack from the deepest entry back to the root, rebuilding
    /// each ancestor around `next` and collapsing redundant structure. The final
    /// result is the new root.
    fn connect_nodes(
        &self,
        mut next: Option<Box<Node>>,
        mut stack: Vec<Ancestor>,
    ) -> Result<Option<Box<Node>>, Error> {
        while let Some(ancestor) = stack.pop() {
            next = match ancestor {
                Ancestor::Branch { mut children, value, index, .. } => {
                    children[index as usize] = next;
                    self.rebuild_branch(children, value)?
                }
                Ancestor::Extension { path, .. } => {
                    let Some(child) = next else {
                        // a branch below an extension always survives as >= 1 node
                        return Err(Error::StructuralInvariantViolation(
                            "extension child removed without collapse",
                        ));
                    };
                    Some(Box::new(self.extend(path, *child)?))
                }
            };
        }
        Ok(next)
    }

    /// Rebuilds a branch after a slot or value substitution, collapsing it when it no
    /// longer carries enough structure: a value-only branch becomes an empty-path
    /// leaf, a single orphaned child is merged into its slot nibble.
    fn rebuild_branch(
        &self,
        mut children: [Option<Box<Node>>; 16],
        value: Option<Vec<u8>>,
    ) -> Result<Option<Box<Node>>, Error> {
        let child_count = children.iter().flatten().count();
        if child_count >= 2 || (child_count == 1 && value.is_some()) {
            return Ok(Some(Box::new(Node::dirty(NodeData::Branch { children, value }))));
        }
        if child_count == 0 {
            return Ok(value
                .map(|value| Box::new(Node::dirty(NodeData::Leaf { path: Nibbles::new(), value }))));
        }

        let (index, slot) = children
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_some())
            .expect("exactly one child remains");
        let mut orphan = slot.take().expect("exactly one child remains");
        orphan.resolve(self.store.as_ref(), &self.node_cache)?;
        let mut prefix = Nibbles::new();
        prefix.push(index as u8);
        Ok(Some(Box::new(self.extend(prefix, *orphan)?)))
    }

    /// Attaches `child` below an extension prefix, collapsing by child kind: leaves
    /// and extensions absorb the prefix, branches get a fresh extension above them.
    fn extend(&self, prefix: Nibbles, child: Node) -> Result<Node, Error> {
        Ok(match child.data {
            NodeData::Leaf { path, value } => {
                Node::dirty(NodeData::Leaf { path: concat(&prefix, &path), value })
            }
            NodeData::Extension { path, child } => {
                Node::dirty(NodeData::Extension { path: concat(&prefix, &path), child })
            }
            NodeData::Branch { .. } | NodeData::Unknown(_) => Node::dirty(NodeData::Extension {
                path: prefix,
                child: Box::new(child),
            }),
        })
    }
}

/// Reassembles the dismantled spine without dirtying anything, restoring the original
/// node metadata. Used by traversals that end up not changing the trie.
fn unwind(mut stack: Vec<Ancestor>, mut node: Option<Box<Node>>) -> Option<Box<Node>> {
    while let Some(ancestor) = stack.pop() {
        node = Some(Box::new(match ancestor {
            Ancestor::Branch { mut children, value, index, dirty, cached } => {
                children[index as usize] = node.take();
                Node {
                    data: NodeData::Branch { children, value },
                    cached_reference: RefCell::new(cached),
                    dirty,
                }
            }
            Ancestor::Extension { path, dirty, cached } => {
                let child = node.take().expect("extension ancestor keeps its child");
                Node {
                    data: NodeData::Extension { path, child },
                    cached_reference: RefCell::new(cached),
                    dirty,
                }
            }
        }));
    }
    node
}

/// Read-side descent. Resolves placeholders in place and never touches the ancestor
/// stack.
fn lookup<S: NodeStore>(
    node: &mut Node,
    path: &[u8],
    cursor: usize,
    store: &S,
    cache: &NodeCache,
) -> Result<Option<Bytes>, Error> {
    node.resolve(store, cache)?;
    match &mut node.data {
        NodeData::Branch { children, value } => {
            if cursor == path.len() {
                return Ok(value.as_ref().map(|value| Bytes::from(value.clone())));
            }
            match &mut children[path[cursor] as usize] {
                Some(child) => lookup(child, path, cursor + 1, store, cache),
                None => Ok(None),
            }
        }
        NodeData::Leaf { path: leaf_path, value } => {
            if leaf_path.as_slice() == &path[cursor..] {
                Ok(Some(Bytes::from(value.clone())))
            } else {
                Ok(None)
            }
        }
        NodeData::Extension { path: ext_path, child } => {
            let remaining = &path[cursor..];
            if remaining.len() >= ext_path.len() && &remaining[..ext_path.len()] == ext_path.as_slice()
            {
                lookup(child, path, cursor + ext_path.len(), store, cache)
            } else {
                Ok(None)
            }
        }
        NodeData::Unknown(_) => {
            Err(Error::StructuralInvariantViolation("unresolved node after resolve"))
        }
    }
}

/// Seals one dirty subtree in post-order: clears dirty flags, computes and caches
/// each node's reference, and records every digest-referenced node for flushing.
fn seal(node: &mut Node, batch: &mut Vec<(B256, Vec<u8>)>) -> Result<(), Error> {
    if !node.dirty {
        return Ok(());
    }
    match &mut node.data {
        NodeData::Leaf { .. } => {}
        NodeData::Extension { child, .. } => seal(child, batch)?,
        NodeData::Branch { children, .. } => {
            for child in children.iter_mut().flatten() {
                seal(child, batch)?;
            }
        }
        NodeData::Unknown(_) => {
            return Err(Error::StructuralInvariantViolation("dirty unresolved node"));
        }
    }
    node.dirty = false;

    let rlp = alloy_rlp::encode(&*node);
    let node_ref = if rlp.len() < 32 {
        NodeRef::Bytes(rlp)
    } else {
        let digest = keccak256(&rlp);
        batch.push((digest, rlp));
        NodeRef::Digest(digest)
    };
    *node.cached_reference.borrow_mut() = Some(node_ref);
    Ok(())
}

/// Joins two nibble runs into a fresh path.
fn concat(prefix: &[u8], tail: &[u8]) -> Nibbles {
    let mut path = Nibbles::with_capacity(prefix.len() + tail.len());
    path.extend_from_slice(prefix);
    path.extend_from_slice(tail);
    path
}
