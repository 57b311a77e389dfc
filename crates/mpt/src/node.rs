//! In-memory MPT node model and its canonical RLP codec.
//!
//! Nodes own their paths, values and children outright. A child slot holds either
//! nothing, a concrete node, or an [`NodeData::Unknown`] placeholder carrying the
//! child's reference until [`Node::resolve`] materializes it from the backing store.
use std::cell::RefCell;

use alloy_primitives::{hex, keccak256, B256};
use alloy_rlp::{Encodable, PayloadView};

use crate::{
    cache::NodeCache,
    hp::{decode_path, encode_path, Nibbles},
    store::NodeStore,
    trie::Error,
};

/// How a parent embeds one of its children in its own RLP encoding.
///
/// A child whose encoding is shorter than 32 bytes is spliced into the parent
/// verbatim; anything longer is stood in for by the Keccak-256 digest of its
/// encoding. Which case applies is decided purely by encoded length, and the
/// distinction is canonical: flattening everything to a digest would change the
/// hashes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum NodeRef {
    /// The child's RLP encoding itself, for encodings under 32 bytes.
    Bytes(Vec<u8>),
    /// Keccak-256 of the child's RLP encoding, for everything 32 bytes and up.
    Digest(B256),
}

impl std::fmt::Display for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeRef::Bytes(bytes) => write!(f, "Bytes(0x{})", hex::encode(bytes)),
            NodeRef::Digest(digest) => write!(f, "Digest({digest:#})"),
        }
    }
}

impl NodeRef {
    /// Hash identity of the referenced node; an inline reference hashes its bytes.
    #[inline]
    pub fn hash(&self) -> B256 {
        match self {
            NodeRef::Bytes(bytes) => keccak256(bytes),
            NodeRef::Digest(digest) => *digest,
        }
    }

    /// Length of this reference when RLP-encoded inside a parent node.
    #[inline]
    fn encoded_length(&self) -> usize {
        match self {
            NodeRef::Bytes(bytes) => bytes.len(),
            NodeRef::Digest(_) => 1 + 32,
        }
    }
}

/// The kind and payload of a trie node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeData {
    /// Terminal node holding the remaining key suffix and the stored value.
    Leaf { path: Nibbles, value: Vec<u8> },
    /// A non-empty shared prefix of all keys passing through. The child always
    /// resolves to a branch; extensions over leaves or other extensions are collapsed
    /// eagerly by the rewrite engine.
    Extension { path: Nibbles, child: Box<Node> },
    /// 16-way radix node. `value` is set only when some key terminates exactly here.
    Branch { children: [Option<Box<Node>>; 16], value: Option<Vec<u8>> },
    /// A node known only by its reference until resolved from the backing store.
    Unknown(NodeRef),
}

/// A trie node together with its reference cache and persistence state.
///
/// `dirty` marks nodes produced by the rewrite engine that have not been committed
/// yet; nodes decoded from the store are clean and carry their reference pre-cached.
#[derive(Debug)]
pub struct Node {
    pub(crate) data: NodeData,
    pub(crate) cached_reference: RefCell<Option<NodeRef>>,
    pub(crate) dirty: bool,
}

impl Clone for Node {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            cached_reference: RefCell::new(self.cached_reference.borrow().clone()),
            dirty: self.dirty,
        }
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Node {}

impl Node {
    /// Creates a dirty node, as produced by the rewrite engine.
    pub(crate) fn dirty(data: NodeData) -> Self {
        Self { data, cached_reference: RefCell::new(None), dirty: true }
    }

    /// Creates a clean placeholder for a node known only by its reference.
    pub(crate) fn from_ref(node_ref: NodeRef) -> Self {
        Self {
            data: NodeData::Unknown(node_ref.clone()),
            cached_reference: RefCell::new(Some(node_ref)),
            dirty: false,
        }
    }

    /// The kind and payload of this node.
    #[inline]
    pub fn as_data(&self) -> &NodeData {
        &self.data
    }

    /// Whether this node has uncommitted changes.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Keccak-256 identity of this node: the digest reference as-is, or the hash of
    /// the encoding when the node is short enough to inline.
    #[inline]
    pub fn hash(&self) -> B256 {
        self.reference().hash()
    }

    /// The reference of this node when embedded inside another node: the raw RLP if it
    /// is shorter than 32 bytes, its Keccak-256 digest otherwise. Cached after the
    /// first call and stable until the node is replaced by the rewrite engine.
    pub fn reference(&self) -> NodeRef {
        self.cached_reference
            .borrow_mut()
            .get_or_insert_with(|| self.calc_reference())
            .clone()
    }

    fn calc_reference(&self) -> NodeRef {
        match &self.data {
            NodeData::Unknown(node_ref) => node_ref.clone(),
            _ => {
                let encoded = alloy_rlp::encode(self);
                if encoded.len() < 32 {
                    NodeRef::Bytes(encoded)
                } else {
                    NodeRef::Digest(keccak256(&encoded))
                }
            }
        }
    }

    /// Encodes the reference of this node into `out`.
    pub(crate) fn reference_encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        match self
            .cached_reference
            .borrow_mut()
            .get_or_insert_with(|| self.calc_reference())
        {
            // a short reference splices its bytes straight into the parent
            NodeRef::Bytes(bytes) => out.put_slice(bytes),
            // a digest always encodes as a 33-byte string
            NodeRef::Digest(digest) => {
                out.put_u8(alloy_rlp::EMPTY_STRING_CODE + 32);
                out.put_slice(digest.as_slice());
            }
        }
    }

    fn reference_length(&self) -> usize {
        self.cached_reference
            .borrow_mut()
            .get_or_insert_with(|| self.calc_reference())
            .encoded_length()
    }

    /// Returns the length of the RLP payload of the node.
    fn payload_length(&self) -> usize {
        match &self.data {
            NodeData::Leaf { path, value } => {
                encode_path(path, true).as_slice().length() + value.as_slice().length()
            }
            NodeData::Extension { path, child } => {
                encode_path(path, false).as_slice().length() + child.reference_length()
            }
            NodeData::Branch { children, value } => {
                let children_length: usize = children
                    .iter()
                    .map(|child| child.as_ref().map_or(1, |node| node.reference_length()))
                    .sum();
                children_length + value.as_ref().map_or(1, |v| v.as_slice().length())
            }
            NodeData::Unknown(_) => 32,
        }
    }

    /// Returns the number of traversable nodes, counting only the resolved part.
    pub fn size(&self) -> usize {
        match &self.data {
            NodeData::Leaf { .. } => 1,
            NodeData::Extension { child, .. } => 1 + child.size(),
            NodeData::Branch { children, .. } => {
                1 + children.iter().flatten().map(|child| child.size()).sum::<usize>()
            }
            NodeData::Unknown(_) => 0,
        }
    }

    /// Materializes an [`NodeData::Unknown`] placeholder by decoding its RLP, fetched
    /// from the node cache or the backing store for digest references and taken
    /// verbatim for inline references. Concrete nodes are left untouched.
    pub(crate) fn resolve<S: NodeStore>(
        &mut self,
        store: &S,
        cache: &NodeCache,
    ) -> Result<(), Error> {
        let node_ref = match &self.data {
            NodeData::Unknown(node_ref) => node_ref.clone(),
            _ => return Ok(()),
        };
        let resolved = match &node_ref {
            NodeRef::Digest(hash) => match cache.get(hash) {
                Some(node) => node,
                None => {
                    let rlp = store.get(hash).ok_or(Error::MissingNode(*hash))?;
                    tracing::trace!(%hash, "resolving node from store");
                    let node = Node::decode(rlp.as_ref())?;
                    cache.put(*hash, node.clone());
                    node
                }
            },
            NodeRef::Bytes(rlp) => Node::decode(rlp)?,
        };
        // short nodes fetched by digest re-cache as inline references, so compare
        // hash identities rather than the references themselves
        debug_assert_eq!(resolved.reference().hash(), node_ref.hash());
        *self = resolved;
        Ok(())
    }

    /// Decodes a single RLP-encoded node.
    ///
    /// Child references decode lazily: an empty string is an absent child, a 32-byte
    /// string an unresolved digest, and an embedded short list an unresolved inline
    /// node. The decoded node is clean and carries its reference pre-cached.
    pub fn decode(rlp: &[u8]) -> Result<Node, Error> {
        let mut buf = rlp;
        let payload = alloy_rlp::Header::decode_raw(&mut buf)?;
        if !buf.is_empty() {
            return Err(Error::MalformedNode("trailing bytes after node"));
        }

        let data = match payload {
            PayloadView::String(_) => return Err(Error::MalformedNode("expected node list")),
            PayloadView::List(items) => match items.len() {
                2 => {
                    let mut path_item = items[0];
                    let path_bytes = alloy_rlp::Header::decode_bytes(&mut path_item, false)?;
                    let (path, is_leaf) = decode_path(path_bytes)?;
                    if is_leaf {
                        let mut value_item = items[1];
                        let value = alloy_rlp::Header::decode_bytes(&mut value_item, false)?;
                        NodeData::Leaf { path, value: value.to_vec() }
                    } else {
                        if path.is_empty() {
                            return Err(Error::MalformedNode("empty extension path"));
                        }
                        let child = decode_child(items[1])?
                            .ok_or(Error::MalformedNode("extension without child"))?;
                        NodeData::Extension { path, child: Box::new(child) }
                    }
                }
                17 => {
                    let mut children: [Option<Box<Node>>; 16] = Default::default();
                    for (slot, item) in children.iter_mut().zip(&items) {
                        *slot = decode_child(item)?.map(Box::new);
                    }
                    let mut value_item = items[16];
                    let value = alloy_rlp::Header::decode_bytes(&mut value_item, false)?;
                    let value = (!value.is_empty()).then(|| value.to_vec());
                    NodeData::Branch { children, value }
                }
                _ => return Err(Error::MalformedNode("unexpected node list arity")),
            },
        };

        let node_ref = if rlp.len() < 32 {
            NodeRef::Bytes(rlp.to_vec())
        } else {
            NodeRef::Digest(keccak256(rlp))
        };
        Ok(Node { data, cached_reference: RefCell::new(Some(node_ref)), dirty: false })
    }
}

/// Decodes one child reference item of a node list.
fn decode_child(item: &[u8]) -> Result<Option<Node>, Error> {
    let mut buf = item;
    match alloy_rlp::Header::decode_raw(&mut buf)? {
        PayloadView::String(payload) => match payload.len() {
            0 => Ok(None),
            32 => Ok(Some(Node::from_ref(NodeRef::Digest(B256::from_slice(payload))))),
            _ => Err(Error::MalformedNode("invalid child reference length")),
        },
        PayloadView::List(_) => {
            if item.len() >= 32 {
                return Err(Error::MalformedNode("embedded child node too long"));
            }
            Ok(Some(Node::from_ref(NodeRef::Bytes(item.to_vec()))))
        }
    }
}

impl Encodable for Node {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        match &self.data {
            NodeData::Leaf { path, value } => {
                alloy_rlp::Header { list: true, payload_length: self.payload_length() }.encode(out);
                encode_path(path, true).as_slice().encode(out);
                value.as_slice().encode(out);
            }
            NodeData::Extension { path, child } => {
                alloy_rlp::Header { list: true, payload_length: self.payload_length() }.encode(out);
                encode_path(path, false).as_slice().encode(out);
                child.reference_encode(out);
            }
            NodeData::Branch { children, value } => {
                alloy_rlp::Header { list: true, payload_length: self.payload_length() }.encode(out);
                for child in children.iter() {
                    match child {
                        Some(node) => node.reference_encode(out),
                        None => out.put_u8(alloy_rlp::EMPTY_STRING_CODE),
                    }
                }
                match value {
                    Some(value) => value.as_slice().encode(out),
                    None => out.put_u8(alloy_rlp::EMPTY_STRING_CODE),
                }
            }
            NodeData::Unknown(node_ref) => match node_ref {
                NodeRef::Bytes(rlp) => out.put_slice(rlp),
                NodeRef::Digest(digest) => digest.encode(out),
            },
        }
    }

    fn length(&self) -> usize {
        match &self.data {
            NodeData::Unknown(node_ref) => node_ref.encoded_length(),
            _ => {
                let payload_length = self.payload_length();
                payload_length + alloy_rlp::length_of_length(payload_length)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hp::bytes_to_nibbles;
    use hex_literal::hex;

    fn roundtrip(node: &Node) -> Node {
        let encoded = alloy_rlp::encode(node);
        assert_eq!(encoded.len(), node.length());
        Node::decode(&encoded).unwrap()
    }

    #[test]
    fn test_leaf_roundtrip() {
        let node = Node::dirty(NodeData::Leaf {
            path: bytes_to_nibbles(b"do"),
            value: b"verb".to_vec(),
        });
        // leaf flag, even length path 0x64 0x6f
        assert_eq!(alloy_rlp::encode(&node), hex!("c98320646f8476657262"));

        let decoded = roundtrip(&node);
        assert_eq!(decoded.data, node.data);
        assert!(!decoded.is_dirty());
        assert_eq!(decoded.reference(), node.reference());
    }

    #[test]
    fn test_branch_roundtrip() {
        let mut children: [Option<Box<Node>>; 16] = Default::default();
        children[3] = Some(Box::new(Node::dirty(NodeData::Leaf {
            path: bytes_to_nibbles(&[0x57]),
            value: vec![0xaa; 40],
        })));
        children[9] = Some(Box::new(Node::dirty(NodeData::Leaf {
            path: Nibbles::new(),
            value: b"x".to_vec(),
        })));
        let node = Node::dirty(NodeData::Branch { children, value: Some(b"mid".to_vec()) });

        let decoded = roundtrip(&node);
        let NodeData::Branch { children, value } = decoded.data else {
            panic!("branch expected");
        };
        assert_eq!(value.as_deref(), Some(b"mid".as_slice()));
        // the long child decodes to a digest placeholder, the short one inlines
        assert!(matches!(
            children[3].as_deref().map(Node::as_data),
            Some(NodeData::Unknown(NodeRef::Digest(_)))
        ));
        assert!(matches!(
            children[9].as_deref().map(Node::as_data),
            Some(NodeData::Unknown(NodeRef::Bytes(_)))
        ));
        assert!(children[0].is_none());
    }

    #[test]
    fn test_extension_roundtrip() {
        let mut children: [Option<Box<Node>>; 16] = Default::default();
        for (i, slot) in children.iter_mut().take(4).enumerate() {
            *slot = Some(Box::new(Node::dirty(NodeData::Leaf {
                path: bytes_to_nibbles(&[i as u8; 8]),
                value: vec![i as u8; 32],
            })));
        }
        let branch = Node::dirty(NodeData::Branch { children, value: None });
        let node = Node::dirty(NodeData::Extension {
            path: Nibbles::from_slice(&[0x0a, 0x0b, 0x0c]),
            child: Box::new(branch),
        });

        let decoded = roundtrip(&node);
        let NodeData::Extension { path, child } = decoded.data else {
            panic!("extension expected");
        };
        assert_eq!(path.as_slice(), &[0x0a, 0x0b, 0x0c]);
        assert!(matches!(child.as_data(), NodeData::Unknown(NodeRef::Digest(_))));
    }

    #[test]
    fn test_reference_duality() {
        // short encodings stay inline, long ones become digests
        let short = Node::dirty(NodeData::Leaf { path: bytes_to_nibbles(b"a"), value: b"1".to_vec() });
        assert!(matches!(short.reference(), NodeRef::Bytes(bytes) if bytes.len() < 32));

        let long = Node::dirty(NodeData::Leaf { path: bytes_to_nibbles(b"a"), value: vec![0x11; 32] });
        let encoded = alloy_rlp::encode(&long);
        assert!(encoded.len() >= 32);
        assert_eq!(long.reference(), NodeRef::Digest(keccak256(&encoded)));
        assert_eq!(long.hash(), keccak256(&encoded));
    }

    #[test]
    fn test_decode_rejects_malformed() {
        // a bare string is not a node
        assert!(Node::decode(&hex!("83010203")).is_err());
        // wrong list arity
        assert!(Node::decode(&hex!("c3010203")).is_err());
        // trailing garbage
        assert!(Node::decode(&hex!("c98320646f847665726200")).is_err());
    }
}
