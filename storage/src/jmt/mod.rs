//! Authenticate the application key-value state with a versioned Jellyfish Merkle Tree.
//!
//! # Overview
//!
//! Keys are placed in a 16-ary radix tree by the nibbles of their SHA-256 digest. Nodes are
//! immutable and addressed by a [NodeKey] of (version, path): updating the tree at a new version
//! writes fresh nodes along every touched path and records the replaced nodes in a
//! [StaleNodeIndex] so they can be reaped once no retained version references them.
//!
//! A subtree holding a single key is collapsed into a [LeafNode] as close to the root as
//! possible. Each [InternalNode] is hashed as a 4-level binary tree over its 16 children, so the
//! root digest equals that of a collapsed binary sparse Merkle tree over the key digests and
//! proofs are binary (one sibling per bit).
//!
//! # Proofs
//!
//! - [SparseMerkleProof] shows that a key maps to a value at a version or that it is absent.
//! - [SubrangeProof] shows that a set of leaves is exactly the content of the tree within a range
//!   of key digests. State sync uses it to verify chunks before writing them.
//!
//! # Example
//!
//! ```rust
//! use bytes::Bytes;
//! use ocr_cryptography::hash;
//! use ocr_storage::jmt::{JellyfishMerkleTree, MockTreeStore, TreeWriter};
//!
//! let mut store = MockTreeStore::default();
//! let updates = vec![(Bytes::from_static(b"a"), Some(Bytes::from_static(b"1")))];
//! let (root, batch) = JellyfishMerkleTree::new(&store).put_value_set(updates, None, 1).unwrap();
//! store.write_node_batch(&batch).unwrap();
//!
//! let tree = JellyfishMerkleTree::new(&store);
//! let (leaf, proof) = tree.get_with_proof(&hash(b"a"), 1).unwrap();
//! assert_eq!(leaf.unwrap().value(), &Bytes::from_static(b"1"));
//! proof.verify(&root, &hash(b"a"), Some(b"1")).unwrap();
//! ```

mod nibble;
pub use nibble::{NibblePath, MAX_NIBBLES};
mod node;
pub use node::{Child, InternalNode, LeafNode, Node, NodeKey, StaleNodeIndex};
mod proof;
pub use proof::{verify_subrange, SparseMerkleProof, SubrangeProof};
mod store;
pub use store::{purge_stale_nodes, wipe, MockTreeStore, TreeReader, TreeWriter};
mod tree;
pub use tree::{JellyfishMerkleTree, RangeRead, TreeUpdateBatch};

use crate::kv;
use ocr_cryptography::{Digest, Sha256};
use thiserror::Error;

/// A version of the tree (the sequence number of the state transition that produced it).
pub type Version = u64;

/// Hash of an empty subtree.
pub const PLACEHOLDER: Digest = Digest::ZERO;

const LEAF_DOMAIN: &[u8] = b"JMT_LEAF";
const INTERNAL_DOMAIN: &[u8] = b"JMT_INTERNAL";

/// Errors that can occur when reading, updating, or proving the tree.
#[derive(Error, Debug)]
pub enum Error {
    #[error("missing node: {0:?}")]
    MissingNode(NodeKey),
    #[error("missing root at version {0}")]
    MissingRoot(Version),
    #[error("unexpected node kind at {0:?}")]
    UnexpectedNode(NodeKey),
    #[error("duplicate key in update batch")]
    DuplicateKey,
    #[error("version {version} precedes base {base}")]
    VersionRegression { base: Version, version: Version },
    #[error("invalid proof: {0}")]
    InvalidProof(&'static str),
    #[error("kv: {0}")]
    Kv(#[from] kv::Error),
    #[error("codec: {0}")]
    Codec(#[from] ocr_codec::Error),
}

/// Hash of a leaf holding a key with digest `key_digest` and a value with digest `value_hash`.
pub fn leaf_hash(key_digest: &Digest, value_hash: &Digest) -> Digest {
    Sha256::new()
        .update(LEAF_DOMAIN)
        .update(key_digest)
        .update(value_hash)
        .finalize()
}

/// Hash of a binary node.
pub fn internal_hash(left: &Digest, right: &Digest) -> Digest {
    Sha256::new()
        .update(INTERNAL_DOMAIN)
        .update(left)
        .update(right)
        .finalize()
}

/// Root of the collapsed binary sparse Merkle tree over `leaves` (sorted by key digest), all of
/// which share their first `depth` bits.
pub(crate) fn collapsed_hash(leaves: &[(Digest, Digest)], depth: usize) -> Digest {
    match leaves {
        [] => PLACEHOLDER,
        [(key_digest, value_hash)] => leaf_hash(key_digest, value_hash),
        _ => {
            let split = leaves.partition_point(|(key_digest, _)| !key_digest.bit(depth));
            internal_hash(
                &collapsed_hash(&leaves[..split], depth + 1),
                &collapsed_hash(&leaves[split..], depth + 1),
            )
        }
    }
}
