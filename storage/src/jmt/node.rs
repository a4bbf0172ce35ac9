//! Nodes of the tree and how they are hashed and stored.

use super::{internal_hash, leaf_hash, NibblePath, Version, PLACEHOLDER};
use bytes::{Buf, BufMut, Bytes};
use ocr_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use ocr_cryptography::{hash, Digest};
use std::collections::BTreeMap;

/// Identifies a stored node: the version that wrote it and its position.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeKey {
    pub version: Version,
    pub path: NibblePath,
}

impl NodeKey {
    pub fn new(version: Version, path: NibblePath) -> Self {
        Self { version, path }
    }

    /// The root of `version`.
    pub fn root(version: Version) -> Self {
        Self::new(version, NibblePath::new())
    }
}

impl Write for NodeKey {
    fn write(&self, buf: &mut impl BufMut) {
        self.version.write(buf);
        self.path.write(buf);
    }
}

impl EncodeSize for NodeKey {
    fn encode_size(&self) -> usize {
        self.version.encode_size() + self.path.encode_size()
    }
}

impl Read for NodeKey {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let version = Version::read(buf)?;
        let path = NibblePath::read(buf)?;
        Ok(Self { version, path })
    }
}

/// Reference from an internal node to one of its children.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Child {
    /// Version at which the child was written.
    pub version: Version,
    pub hash: Digest,
    pub leaf: bool,
}

/// A node with up to 16 children, one per nibble.
///
/// The node is hashed as a 4-level binary tree over its children where empty ranges hash to
/// [PLACEHOLDER] and a range holding a single leaf hashes to that leaf. The resulting root is
/// independent of how keys are grouped into nibbles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InternalNode {
    children: BTreeMap<u8, Child>,
}

impl InternalNode {
    pub fn new(children: BTreeMap<u8, Child>) -> Self {
        Self { children }
    }

    pub fn child(&self, nibble: u8) -> Option<&Child> {
        self.children.get(&nibble)
    }

    pub fn children(&self) -> impl Iterator<Item = (u8, &Child)> {
        self.children.iter().map(|(n, c)| (*n, c))
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn hash(&self) -> Digest {
        self.merkle_hash(0, 16)
    }

    /// Hash of the children with nibbles in `[start, start + width)`.
    pub(crate) fn merkle_hash(&self, start: u8, width: u8) -> Digest {
        let mut range = self.children.range(start..start + width);
        let Some((_, first)) = range.next() else {
            return PLACEHOLDER;
        };
        let single = range.next().is_none();
        if single && (first.leaf || width == 1) {
            return first.hash;
        }
        let half = width / 2;
        internal_hash(
            &self.merkle_hash(start, half),
            &self.merkle_hash(start + half, half),
        )
    }

    /// Number of children with nibbles in `[start, start + width)`.
    pub(crate) fn count(&self, start: u8, width: u8) -> usize {
        self.children.range(start..start + width).count()
    }

    /// The only child with a nibble in `[start, start + width)`, if exactly one exists.
    pub(crate) fn only(&self, start: u8, width: u8) -> Option<(u8, &Child)> {
        let mut range = self.children.range(start..start + width);
        let (nibble, child) = range.next()?;
        if range.next().is_some() {
            return None;
        }
        Some((*nibble, child))
    }
}

/// A key-value pair of the application state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafNode {
    key_digest: Digest,
    key: Bytes,
    value: Bytes,
}

impl LeafNode {
    pub fn new(key: Bytes, value: Bytes) -> Self {
        Self {
            key_digest: hash(&key),
            key,
            value,
        }
    }

    pub fn key_digest(&self) -> &Digest {
        &self.key_digest
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn value_hash(&self) -> Digest {
        hash(&self.value)
    }

    pub fn hash(&self) -> Digest {
        leaf_hash(&self.key_digest, &self.value_hash())
    }

    pub fn into_parts(self) -> (Bytes, Bytes) {
        (self.key, self.value)
    }
}

impl Write for LeafNode {
    fn write(&self, buf: &mut impl BufMut) {
        self.key.write(buf);
        self.value.write(buf);
    }
}

impl EncodeSize for LeafNode {
    fn encode_size(&self) -> usize {
        self.key.encode_size() + self.value.encode_size()
    }
}

impl Read for LeafNode {
    /// Limits on the key and value lengths.
    type Cfg = (RangeCfg, RangeCfg);

    fn read_cfg(buf: &mut impl Buf, (key, value): &Self::Cfg) -> Result<Self, CodecError> {
        let key = Bytes::read_cfg(buf, key)?;
        let value = Bytes::read_cfg(buf, value)?;
        Ok(Self::new(key, value))
    }
}

/// A node of the tree.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Node {
    /// The root of an empty tree.
    Null,
    Internal(InternalNode),
    Leaf(LeafNode),
}

impl Node {
    pub fn hash(&self) -> Digest {
        match self {
            Node::Null => PLACEHOLDER,
            Node::Internal(internal) => internal.hash(),
            Node::Leaf(leaf) => leaf.hash(),
        }
    }
}

const NULL_TAG: u8 = 0;
const INTERNAL_TAG: u8 = 1;
const LEAF_TAG: u8 = 2;

impl Write for Node {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Node::Null => NULL_TAG.write(buf),
            Node::Internal(internal) => {
                INTERNAL_TAG.write(buf);
                let bitmap = internal
                    .children
                    .keys()
                    .fold(0u16, |bitmap, nibble| bitmap | (1 << nibble));
                bitmap.write(buf);
                for child in internal.children.values() {
                    child.version.write(buf);
                    child.hash.write(buf);
                    child.leaf.write(buf);
                }
            }
            Node::Leaf(leaf) => {
                LEAF_TAG.write(buf);
                leaf.write(buf);
            }
        }
    }
}

impl EncodeSize for Node {
    fn encode_size(&self) -> usize {
        1 + match self {
            Node::Null => 0,
            Node::Internal(internal) => 2 + internal.children.len() * (8 + 32 + 1),
            Node::Leaf(leaf) => leaf.encode_size(),
        }
    }
}

impl Read for Node {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            NULL_TAG => Ok(Node::Null),
            INTERNAL_TAG => {
                let bitmap = u16::read(buf)?;
                let mut children = BTreeMap::new();
                for nibble in 0..16u8 {
                    if bitmap & (1 << nibble) == 0 {
                        continue;
                    }
                    let version = Version::read(buf)?;
                    let hash = Digest::read(buf)?;
                    let leaf = bool::read(buf)?;
                    children.insert(
                        nibble,
                        Child {
                            version,
                            hash,
                            leaf,
                        },
                    );
                }
                Ok(Node::Internal(InternalNode::new(children)))
            }
            LEAF_TAG => {
                let cfg = (RangeCfg::from(..), RangeCfg::from(..));
                Ok(Node::Leaf(LeafNode::read_cfg(buf, &cfg)?))
            }
            tag => Err(CodecError::InvalidEnum("Node", tag)),
        }
    }
}

/// A node that is no longer reachable from any root at or after `stale_since_version`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StaleNodeIndex {
    pub stale_since_version: Version,
    pub node_key: NodeKey,
}

impl Write for StaleNodeIndex {
    fn write(&self, buf: &mut impl BufMut) {
        self.stale_since_version.write(buf);
        self.node_key.write(buf);
    }
}

impl EncodeSize for StaleNodeIndex {
    fn encode_size(&self) -> usize {
        self.stale_since_version.encode_size() + self.node_key.encode_size()
    }
}

impl Read for StaleNodeIndex {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let stale_since_version = Version::read(buf)?;
        let node_key = NodeKey::read(buf)?;
        Ok(Self {
            stale_since_version,
            node_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocr_codec::{DecodeExt, Encode};

    fn child(hash: Digest, leaf: bool) -> Child {
        Child {
            version: 1,
            hash,
            leaf,
        }
    }

    #[test]
    fn test_single_leaf_collapses() {
        let leaf = LeafNode::new(Bytes::from_static(b"k"), Bytes::from_static(b"v"));
        let node = InternalNode::new(BTreeMap::from([(7, child(leaf.hash(), true))]));
        assert_eq!(node.hash(), leaf.hash());
    }

    #[test]
    fn test_single_internal_does_not_collapse() {
        let digest = hash(b"subtree");
        let node = InternalNode::new(BTreeMap::from([(0, child(digest, false))]));
        let mut expected = digest;
        for _ in 0..4 {
            expected = internal_hash(&expected, &PLACEHOLDER);
        }
        assert_eq!(node.hash(), expected);
    }

    #[test]
    fn test_two_children() {
        let a = hash(b"a");
        let b = hash(b"b");
        let node = InternalNode::new(BTreeMap::from([(0, child(a, true)), (15, child(b, true))]));
        assert_eq!(node.hash(), internal_hash(&a, &b));
    }

    #[test]
    fn test_node_codec() {
        let leaf = LeafNode::new(Bytes::from_static(b"key"), Bytes::from_static(b"value"));
        let internal = InternalNode::new(BTreeMap::from([
            (3, child(hash(b"x"), true)),
            (9, child(hash(b"y"), false)),
        ]));
        for node in [Node::Null, Node::Leaf(leaf), Node::Internal(internal)] {
            let encoded = node.encode();
            assert_eq!(Node::decode(encoded).unwrap(), node);
        }
        assert!(matches!(
            Node::decode(bytes::Bytes::from_static(&[9])),
            Err(CodecError::InvalidEnum("Node", 9))
        ));
    }

    #[test]
    fn test_stale_index_orders_by_version() {
        let early = StaleNodeIndex {
            stale_since_version: 1,
            node_key: NodeKey::root(9),
        };
        let late = StaleNodeIndex {
            stale_since_version: 2,
            node_key: NodeKey::root(0),
        };
        assert!(early.encode() < late.encode());
        assert!(early < late);
    }
}
