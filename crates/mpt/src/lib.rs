//! Store-backed Merkle Patricia Trie (MPT).
//!
//! An authenticated, persistent key/value map whose root is a 32-byte Keccak-256
//! digest committing to the entire content. The trie mutates in memory and flushes
//! newly created nodes into a content-addressed [`NodeStore`] on [`Trie::commit`];
//! untouched subtrees stay in the store and resolve lazily during traversal.

mod cache;
mod hp;
mod node;
mod store;
mod trie;

pub use cache::{NodeCache, DEFAULT_NODE_CACHE_CAPACITY};
pub use node::{Node, NodeData, NodeRef};
pub use store::{B256Map, MemoryNodeStore, NodeStore};
pub use trie::{Error, Trie, EMPTY_ROOT};
