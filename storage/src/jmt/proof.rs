//! Proofs of membership, non-membership, and subrange completeness.

use super::{collapsed_hash, internal_hash, leaf_hash, Error, LeafNode, PLACEHOLDER};
use bytes::{Buf, BufMut};
use ocr_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use ocr_cryptography::{hash, Digest};

/// Number of bits in a key digest.
const DEPTH: usize = 256;

/// A path from the root to the subtree where a key lives (or would live).
///
/// `siblings` are ordered from the root down; the `i`-th sibling is the hash of the subtree
/// branching off at bit `i` of the key digest. The path ends at `leaf` (the only key in that
/// subtree) or at an empty subtree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SparseMerkleProof {
    leaf: Option<(Digest, Digest)>,
    siblings: Vec<Digest>,
}

impl SparseMerkleProof {
    /// `leaf` is the (key digest, value digest) of the leaf the path ends at.
    pub fn new(leaf: Option<(Digest, Digest)>, siblings: Vec<Digest>) -> Self {
        Self { leaf, siblings }
    }

    pub fn leaf(&self) -> Option<&(Digest, Digest)> {
        self.leaf.as_ref()
    }

    pub fn siblings(&self) -> &[Digest] {
        &self.siblings
    }

    /// Verify that `key_digest` maps to `value` (or is absent if `value` is `None`) in the tree
    /// with `root`.
    pub fn verify(
        &self,
        root: &Digest,
        key_digest: &Digest,
        value: Option<&[u8]>,
    ) -> Result<(), Error> {
        if self.siblings.len() > DEPTH {
            return Err(Error::InvalidProof("too many siblings"));
        }
        let mut current = match (&self.leaf, value) {
            (Some((leaf_key, value_hash)), Some(value)) => {
                if leaf_key != key_digest {
                    return Err(Error::InvalidProof("leaf key mismatch"));
                }
                if *value_hash != hash(value) {
                    return Err(Error::InvalidProof("leaf value mismatch"));
                }
                leaf_hash(leaf_key, value_hash)
            }
            (Some((leaf_key, value_hash)), None) => {
                if leaf_key == key_digest {
                    return Err(Error::InvalidProof("key is present"));
                }
                if !shares_prefix(leaf_key, key_digest, self.siblings.len()) {
                    return Err(Error::InvalidProof("leaf outside subtree"));
                }
                leaf_hash(leaf_key, value_hash)
            }
            (None, Some(_)) => return Err(Error::InvalidProof("missing leaf")),
            (None, None) => PLACEHOLDER,
        };
        for (depth, sibling) in self.siblings.iter().enumerate().rev() {
            current = if key_digest.bit(depth) {
                internal_hash(sibling, &current)
            } else {
                internal_hash(&current, sibling)
            };
        }
        if current != *root {
            return Err(Error::InvalidProof("root mismatch"));
        }
        Ok(())
    }
}

fn shares_prefix(a: &Digest, b: &Digest, bits: usize) -> bool {
    (0..bits).all(|i| a.bit(i) == b.bit(i))
}

impl Write for SparseMerkleProof {
    fn write(&self, buf: &mut impl BufMut) {
        match &self.leaf {
            Some((key_digest, value_hash)) => {
                true.write(buf);
                key_digest.write(buf);
                value_hash.write(buf);
            }
            None => false.write(buf),
        }
        self.siblings.write(buf);
    }
}

impl EncodeSize for SparseMerkleProof {
    fn encode_size(&self) -> usize {
        1 + self.leaf.map_or(0, |_| 64) + self.siblings.encode_size()
    }
}

impl Read for SparseMerkleProof {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let leaf = if bool::read(buf)? {
            Some((Digest::read(buf)?, Digest::read(buf)?))
        } else {
            None
        };
        let siblings = Vec::<Digest>::read_cfg(buf, &(RangeCfg::from(..=DEPTH), ()))?;
        Ok(Self { leaf, siblings })
    }
}

/// Proofs of the first and last key digest of a range.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubrangeProof {
    pub left: SparseMerkleProof,
    pub right: SparseMerkleProof,
}

impl Write for SubrangeProof {
    fn write(&self, buf: &mut impl BufMut) {
        self.left.write(buf);
        self.right.write(buf);
    }
}

impl EncodeSize for SubrangeProof {
    fn encode_size(&self) -> usize {
        self.left.encode_size() + self.right.encode_size()
    }
}

impl Read for SubrangeProof {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let left = SparseMerkleProof::read(buf)?;
        let right = SparseMerkleProof::read(buf)?;
        Ok(Self { left, right })
    }
}

/// Verify that `leaves` are exactly the leaves with key digests in `[start, end]` of the tree
/// with `root`.
///
/// `leaves` must be sorted by key digest. Subtrees entirely inside the range are recomputed from
/// `leaves`, subtrees entirely outside are taken from the boundary proofs, and the two subtrees
/// the boundaries end in are checked against the leaves the proofs terminate at.
pub fn verify_subrange(
    root: &Digest,
    start: &Digest,
    end: &Digest,
    leaves: &[LeafNode],
    proof: &SubrangeProof,
) -> Result<(), Error> {
    if start > end {
        return Err(Error::InvalidProof("empty range"));
    }
    let mut delivered: Vec<(Digest, Digest)> = Vec::with_capacity(leaves.len());
    for leaf in leaves {
        let key_digest = *leaf.key_digest();
        if key_digest < *start || key_digest > *end {
            return Err(Error::InvalidProof("leaf outside range"));
        }
        if let Some((previous, _)) = delivered.last() {
            if *previous >= key_digest {
                return Err(Error::InvalidProof("leaves not sorted"));
            }
        }
        delivered.push((key_digest, leaf.value_hash()));
    }
    if proof.left.siblings.len() > DEPTH || proof.right.siblings.len() > DEPTH {
        return Err(Error::InvalidProof("too many siblings"));
    }

    let verifier = Verifier {
        start,
        end,
        leaves: &delivered,
        proof,
    };
    if verifier.hash(0, Digest::ZERO)? != *root {
        return Err(Error::InvalidProof("root mismatch"));
    }
    Ok(())
}

struct Verifier<'a> {
    start: &'a Digest,
    end: &'a Digest,
    leaves: &'a [(Digest, Digest)],
    proof: &'a SubrangeProof,
}

impl Verifier<'_> {
    /// Hash of the subtree of digests sharing the first `depth` bits of `prefix`.
    ///
    /// Only called for subtrees that intersect the range.
    fn hash(&self, depth: usize, prefix: Digest) -> Result<Digest, Error> {
        let lo = prefix;
        let hi = fill(&prefix, depth);
        let from = self.leaves.partition_point(|(d, _)| *d < lo);
        let to = self.leaves.partition_point(|(d, _)| *d <= hi);
        let inside = &self.leaves[from..to];

        if *self.start <= lo && hi <= *self.end {
            return Ok(collapsed_hash(inside, depth));
        }
        let has_start = lo <= *self.start && *self.start <= hi;
        let has_end = lo <= *self.end && *self.end <= hi;
        if has_start && depth == self.proof.left.siblings.len() {
            return self.terminal(&self.proof.left, lo, hi, inside);
        }
        if has_end && depth == self.proof.right.siblings.len() {
            return self.terminal(&self.proof.right, lo, hi, inside);
        }
        if depth >= DEPTH {
            return Err(Error::InvalidProof("proof too short"));
        }

        let left_prefix = prefix;
        let mut right_prefix = prefix;
        right_prefix.0[depth / 8] |= 0x80 >> (depth % 8);
        let left = if fill(&left_prefix, depth + 1) < *self.start {
            sibling(&self.proof.left, depth)?
        } else {
            self.hash(depth + 1, left_prefix)?
        };
        let right = if right_prefix > *self.end {
            sibling(&self.proof.right, depth)?
        } else {
            self.hash(depth + 1, right_prefix)?
        };
        Ok(internal_hash(&left, &right))
    }

    /// Hash of a subtree a boundary proof ends in, which holds at most one leaf.
    fn terminal(
        &self,
        proof: &SparseMerkleProof,
        lo: Digest,
        hi: Digest,
        inside: &[(Digest, Digest)],
    ) -> Result<Digest, Error> {
        let Some((key_digest, value_hash)) = proof.leaf else {
            if !inside.is_empty() {
                return Err(Error::InvalidProof("leaves in empty subtree"));
            }
            return Ok(PLACEHOLDER);
        };
        if key_digest < lo || key_digest > hi {
            return Err(Error::InvalidProof("boundary leaf outside subtree"));
        }
        let expected: &[(Digest, Digest)] =
            if *self.start <= key_digest && key_digest <= *self.end {
                &[(key_digest, value_hash)]
            } else {
                &[]
            };
        if inside != expected {
            return Err(Error::InvalidProof("boundary leaf mismatch"));
        }
        Ok(leaf_hash(&key_digest, &value_hash))
    }
}

fn sibling(proof: &SparseMerkleProof, depth: usize) -> Result<Digest, Error> {
    proof
        .siblings
        .get(depth)
        .copied()
        .ok_or(Error::InvalidProof("proof too short"))
}

/// `prefix` with every bit at or after `depth` set.
fn fill(prefix: &Digest, depth: usize) -> Digest {
    let mut out = *prefix;
    for i in depth..DEPTH {
        out.0[i / 8] |= 0x80 >> (i % 8);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jmt::{JellyfishMerkleTree, MockTreeStore, TreeWriter};
    use bytes::Bytes;
    use ocr_codec::{DecodeExt, Encode};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn tree(n: usize) -> (MockTreeStore, Digest) {
        let mut store = MockTreeStore::default();
        let updates = (0..n)
            .map(|i| {
                (
                    Bytes::from(format!("key-{i}")),
                    Some(Bytes::from(format!("value-{i}"))),
                )
            })
            .collect();
        let (root, batch) = JellyfishMerkleTree::new(&store)
            .put_value_set(updates, None, 1)
            .unwrap();
        store.write_node_batch(&batch).unwrap();
        (store, root)
    }

    #[test]
    fn test_inclusion() {
        let (store, root) = tree(100);
        let tree = JellyfishMerkleTree::new(&store);
        for i in 0..100 {
            let key = format!("key-{i}");
            let value = format!("value-{i}");
            let (leaf, proof) = tree.get_with_proof(&hash(key.as_bytes()), 1).unwrap();
            assert_eq!(leaf.unwrap().value().as_ref(), value.as_bytes());
            proof
                .verify(&root, &hash(key.as_bytes()), Some(value.as_bytes()))
                .unwrap();

            // Wrong value or absence claims fail
            assert!(proof
                .verify(&root, &hash(key.as_bytes()), Some(b"other"))
                .is_err());
            assert!(proof.verify(&root, &hash(key.as_bytes()), None).is_err());
        }
    }

    #[test]
    fn test_exclusion() {
        let (store, root) = tree(100);
        let tree = JellyfishMerkleTree::new(&store);
        for i in 100..200 {
            let key_digest = hash(format!("key-{i}").as_bytes());
            let (leaf, proof) = tree.get_with_proof(&key_digest, 1).unwrap();
            assert!(leaf.is_none());
            proof.verify(&root, &key_digest, None).unwrap();
            assert!(proof.verify(&root, &key_digest, Some(b"x")).is_err());
        }
    }

    #[test]
    fn test_empty_tree_exclusion() {
        let (store, root) = tree(0);
        let (_, proof) = JellyfishMerkleTree::new(&store)
            .get_with_proof(&hash(b"anything"), 1)
            .unwrap();
        assert_eq!(root, PLACEHOLDER);
        proof.verify(&root, &hash(b"anything"), None).unwrap();
    }

    #[test]
    fn test_tampered_sibling() {
        let (store, root) = tree(10);
        let key_digest = hash(b"key-3");
        let (_, proof) = JellyfishMerkleTree::new(&store)
            .get_with_proof(&key_digest, 1)
            .unwrap();
        let mut siblings = proof.siblings().to_vec();
        siblings[0] = hash(b"forged");
        let forged = SparseMerkleProof::new(proof.leaf().copied(), siblings);
        assert!(matches!(
            forged.verify(&root, &key_digest, Some(b"value-3")),
            Err(Error::InvalidProof("root mismatch"))
        ));
    }

    #[test]
    fn test_proof_codec() {
        let (store, _) = tree(10);
        let tree = JellyfishMerkleTree::new(&store);
        let proof = tree
            .prove_subrange(1, &hash(b"key-1"), &hash(b"key-2"))
            .unwrap();
        let decoded = SubrangeProof::decode(proof.encode()).unwrap();
        assert_eq!(decoded, proof);
    }

    fn random_digest(rng: &mut StdRng) -> Digest {
        Digest(rng.gen())
    }

    #[test]
    fn test_subrange_honest() {
        let mut rng = StdRng::seed_from_u64(1);
        for n in [0, 1, 2, 17, 200] {
            let (store, root) = tree(n);
            let tree = JellyfishMerkleTree::new(&store);
            for _ in 0..20 {
                let (mut start, mut end) = (random_digest(&mut rng), random_digest(&mut rng));
                if start > end {
                    std::mem::swap(&mut start, &mut end);
                }
                let read = tree
                    .get_range(1, &start, &end, usize::MAX, usize::MAX)
                    .unwrap();
                let proof = tree.prove_subrange(1, &start, &end).unwrap();
                verify_subrange(&root, &start, &end, &read.leaves, &proof).unwrap();
            }

            // Entire key space
            let read = tree
                .get_range(1, &Digest::ZERO, &Digest::MAX, usize::MAX, usize::MAX)
                .unwrap();
            assert_eq!(read.leaves.len(), n);
            let proof = tree.prove_subrange(1, &Digest::ZERO, &Digest::MAX).unwrap();
            verify_subrange(&root, &Digest::ZERO, &Digest::MAX, &read.leaves, &proof).unwrap();
        }
    }

    #[test]
    fn test_subrange_chunks_cover_tree() {
        let (store, root) = tree(150);
        let tree = JellyfishMerkleTree::new(&store);
        let mut start = Digest::ZERO;
        let mut total = 0;
        loop {
            let read = tree.get_range(1, &start, &Digest::MAX, 16, usize::MAX).unwrap();
            let proof = tree.prove_subrange(1, &start, &read.last).unwrap();
            verify_subrange(&root, &start, &read.last, &read.leaves, &proof).unwrap();
            total += read.leaves.len();
            match read.last.successor() {
                Some(next) if read.truncated => start = next,
                _ => break,
            }
        }
        assert_eq!(total, 150);
    }

    #[test]
    fn test_subrange_rejects_tampering() {
        let (store, root) = tree(200);
        let tree = JellyfishMerkleTree::new(&store);
        let start = Digest([0x20; 32]);
        let end = Digest([0xa0; 32]);
        let read = tree.get_range(1, &start, &end, usize::MAX, usize::MAX).unwrap();
        let proof = tree.prove_subrange(1, &start, &end).unwrap();
        assert!(read.leaves.len() > 3);
        verify_subrange(&root, &start, &end, &read.leaves, &proof).unwrap();

        // Omitted leaf
        let mut omitted = read.leaves.clone();
        omitted.remove(1);
        assert!(verify_subrange(&root, &start, &end, &omitted, &proof).is_err());

        // Altered value
        let mut altered = read.leaves.clone();
        let (key, _) = altered[2].clone().into_parts();
        altered[2] = LeafNode::new(key, Bytes::from_static(b"forged"));
        assert!(verify_subrange(&root, &start, &end, &altered, &proof).is_err());

        // Extra leaf inside the range
        let mut extra = read.leaves.clone();
        let mut i = 0u64;
        let forged = loop {
            let leaf = LeafNode::new(Bytes::from(format!("forged-{i}")), Bytes::new());
            if *leaf.key_digest() > start && *leaf.key_digest() < end {
                break leaf;
            }
            i += 1;
        };
        let position = extra.partition_point(|l| l.key_digest() < forged.key_digest());
        extra.insert(position, forged);
        assert!(verify_subrange(&root, &start, &end, &extra, &proof).is_err());

        // Unsorted
        let mut unsorted = read.leaves.clone();
        unsorted.swap(0, 1);
        assert!(matches!(
            verify_subrange(&root, &start, &end, &unsorted, &proof),
            Err(Error::InvalidProof("leaves not sorted"))
        ));

        // Proof for another range
        let other = tree.prove_subrange(1, &Digest::ZERO, &end).unwrap();
        assert!(verify_subrange(&root, &start, &end, &read.leaves, &other).is_err());

        // Wrong root
        assert!(verify_subrange(&hash(b"root"), &start, &end, &read.leaves, &proof).is_err());
    }
}
