//! Read, update, and prove the tree.

use super::{
    Child, Error, InternalNode, LeafNode, NibblePath, Node, NodeKey, SparseMerkleProof,
    StaleNodeIndex, SubrangeProof, TreeReader, Version, PLACEHOLDER,
};
use bytes::Bytes;
use ocr_cryptography::{hash, Digest};
use std::collections::{BTreeMap, BTreeSet};

/// Changes produced by [JellyfishMerkleTree::put_value_set].
///
/// Writers must remove `deleted` before inserting `nodes`.
#[derive(Clone, Debug, Default)]
pub struct TreeUpdateBatch {
    /// Nodes written at the new version.
    pub nodes: BTreeMap<NodeKey, Node>,

    /// Nodes replaced by this update that older versions may still reference.
    pub stale: Vec<StaleNodeIndex>,

    /// Nodes written earlier at the same version that this update replaced.
    pub deleted: BTreeSet<NodeKey>,
}

impl TreeUpdateBatch {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.stale.is_empty() && self.deleted.is_empty()
    }
}

/// Leaves returned by [JellyfishMerkleTree::get_range].
#[derive(Clone, Debug)]
pub struct RangeRead {
    /// Leaves in ascending key digest order.
    pub leaves: Vec<LeafNode>,

    /// Largest digest covered: the last leaf if `truncated`, otherwise the requested end.
    pub last: Digest,

    /// Whether leaves in `(last, end]` were omitted to respect the limits.
    pub truncated: bool,
}

/// A change to one key, identified by the key's digest. `None` deletes.
type Update = (Digest, Option<LeafNode>);

/// Result of rebuilding a subtree.
enum Subtree {
    Empty,

    /// The subtree holds one leaf. `at` is where it is currently stored, if anywhere.
    Leaf {
        leaf: LeafNode,
        at: Option<NodeKey>,
    },

    /// An internal node written at the new version.
    Internal(Digest),

    /// An existing child left untouched.
    Unchanged(Child),
}

struct Builder<'a, R: TreeReader> {
    reader: &'a R,
    version: Version,
    batch: TreeUpdateBatch,
}

impl<R: TreeReader> Builder<'_, R> {
    fn write(&mut self, key: NodeKey, node: Node) {
        self.batch.deleted.remove(&key);
        self.batch.nodes.insert(key, node);
    }

    fn retire(&mut self, key: NodeKey) {
        if key.version == self.version {
            self.batch.nodes.remove(&key);
            self.batch.deleted.insert(key);
            return;
        }
        self.batch.stale.push(StaleNodeIndex {
            stale_since_version: self.version,
            node_key: key,
        });
    }

    fn load_leaf(&self, key: NodeKey) -> Result<(LeafNode, NodeKey), Error> {
        match self.reader.get_node(&key)? {
            Node::Leaf(leaf) => Ok((leaf, key)),
            _ => Err(Error::UnexpectedNode(key)),
        }
    }

    /// Apply `updates` (sorted, all under `path`) to the subtree rooted at `existing`.
    fn update(
        &mut self,
        path: &NibblePath,
        existing: Option<(NodeKey, Node)>,
        updates: &[Update],
    ) -> Result<Subtree, Error> {
        match existing {
            None => self.build(path, inserts(updates)),
            Some((key, Node::Null)) => {
                self.retire(key);
                self.build(path, inserts(updates))
            }
            Some((key, Node::Leaf(old))) => {
                let replaced = updates.iter().any(|(d, _)| d == old.key_digest());
                let mut leaves = inserts(updates);
                if !replaced {
                    if leaves.is_empty() {
                        return Ok(Subtree::Leaf {
                            leaf: old,
                            at: Some(key),
                        });
                    }
                    let position = leaves.partition_point(|l| l.key_digest() < old.key_digest());
                    leaves.insert(position, old);
                }
                self.retire(key);
                self.build(path, leaves)
            }
            Some((key, Node::Internal(node))) => {
                let depth = path.len();
                let mut outcomes = Vec::new();
                let mut rest = updates;
                for nibble in 0..16u8 {
                    let split = rest.partition_point(|(d, _)| d.nibble(depth) == nibble);
                    let (group, tail) = rest.split_at(split);
                    rest = tail;

                    let outcome = match (node.child(nibble), group.is_empty()) {
                        (None, true) => continue,
                        (Some(child), true) => Subtree::Unchanged(child.clone()),
                        (child, false) => {
                            let child_path = path.child(nibble);
                            let existing = match child {
                                Some(child) => {
                                    let key = NodeKey::new(child.version, child_path.clone());
                                    let node = self.reader.get_node(&key)?;
                                    Some((key, node))
                                }
                                None => None,
                            };
                            self.update(&child_path, existing, group)?
                        }
                    };
                    if !matches!(outcome, Subtree::Empty) {
                        outcomes.push((nibble, outcome));
                    }
                }
                self.retire(key);
                self.finish(path, outcomes)
            }
        }
    }

    /// Build a fresh subtree at `path` holding `leaves` (sorted by digest).
    fn build(&mut self, path: &NibblePath, mut leaves: Vec<LeafNode>) -> Result<Subtree, Error> {
        if leaves.len() <= 1 {
            return Ok(match leaves.pop() {
                Some(leaf) => Subtree::Leaf { leaf, at: None },
                None => Subtree::Empty,
            });
        }
        let depth = path.len();
        let mut groups: BTreeMap<u8, Vec<LeafNode>> = BTreeMap::new();
        for leaf in leaves {
            groups
                .entry(leaf.key_digest().nibble(depth))
                .or_default()
                .push(leaf);
        }
        let mut outcomes = Vec::with_capacity(groups.len());
        for (nibble, group) in groups {
            let outcome = self.build(&path.child(nibble), group)?;
            outcomes.push((nibble, outcome));
        }
        self.finish(path, outcomes)
    }

    /// Combine the non-empty children of `path` into a subtree, collapsing a lone leaf upward.
    fn finish(
        &mut self,
        path: &NibblePath,
        mut outcomes: Vec<(u8, Subtree)>,
    ) -> Result<Subtree, Error> {
        if outcomes.len() == 1 {
            match outcomes.pop() {
                Some((_, leaf @ Subtree::Leaf { .. })) => return Ok(leaf),
                Some((nibble, Subtree::Unchanged(child))) if child.leaf => {
                    let key = NodeKey::new(child.version, path.child(nibble));
                    let (leaf, key) = self.load_leaf(key)?;
                    return Ok(Subtree::Leaf {
                        leaf,
                        at: Some(key),
                    });
                }
                Some(other) => outcomes.push(other),
                None => {}
            }
        }
        if outcomes.is_empty() {
            return Ok(Subtree::Empty);
        }

        let mut children = BTreeMap::new();
        for (nibble, outcome) in outcomes {
            if let Some(child) = self.place(path.child(nibble), outcome) {
                children.insert(nibble, child);
            }
        }
        let node = InternalNode::new(children);
        let hash = node.hash();
        self.write(NodeKey::new(self.version, path.clone()), Node::Internal(node));
        Ok(Subtree::Internal(hash))
    }

    /// Store `outcome` at `path` (if it is not already there) and reference it from the parent.
    fn place(&mut self, path: NibblePath, outcome: Subtree) -> Option<Child> {
        match outcome {
            Subtree::Empty => None,
            Subtree::Unchanged(child) => Some(child),
            Subtree::Internal(hash) => Some(Child {
                version: self.version,
                hash,
                leaf: false,
            }),
            Subtree::Leaf { leaf, at } => {
                let hash = leaf.hash();
                match at {
                    Some(at) if at.path == path => Some(Child {
                        version: at.version,
                        hash,
                        leaf: true,
                    }),
                    at => {
                        if let Some(at) = at {
                            self.retire(at);
                        }
                        self.write(NodeKey::new(self.version, path), Node::Leaf(leaf));
                        Some(Child {
                            version: self.version,
                            hash,
                            leaf: true,
                        })
                    }
                }
            }
        }
    }
}

fn inserts(updates: &[Update]) -> Vec<LeafNode> {
    updates
        .iter()
        .filter_map(|(_, leaf)| leaf.clone())
        .collect()
}

/// Read, update, and prove a tree stored in `R`.
pub struct JellyfishMerkleTree<'a, R: TreeReader> {
    reader: &'a R,
}

impl<'a, R: TreeReader> JellyfishMerkleTree<'a, R> {
    pub fn new(reader: &'a R) -> Self {
        Self { reader }
    }

    fn root(&self, version: Version) -> Result<(NodeKey, Node), Error> {
        let key = NodeKey::root(version);
        let node = self
            .reader
            .get_node_option(&key)?
            .ok_or(Error::MissingRoot(version))?;
        Ok((key, node))
    }

    /// Root digest of `version`.
    pub fn get_root_hash(&self, version: Version) -> Result<Digest, Error> {
        Ok(self.root(version)?.1.hash())
    }

    /// Root digest of `version`, or `None` if the version was never written (or was reaped).
    pub fn get_root_hash_option(&self, version: Version) -> Result<Option<Digest>, Error> {
        Ok(self
            .reader
            .get_node_option(&NodeKey::root(version))?
            .map(|node| node.hash()))
    }

    /// Compute the tree at `version` by applying `value_set` to the tree at `base`.
    ///
    /// `None` values delete their key. With `base` of `None`, the tree starts empty. `version`
    /// may equal `base`, in which case the nodes the update replaces are deleted outright instead
    /// of being marked stale.
    ///
    /// Nothing is written: the caller persists the returned batch with a
    /// [super::TreeWriter], which makes it possible to compute a root before committing to it.
    pub fn put_value_set(
        &self,
        value_set: Vec<(Bytes, Option<Bytes>)>,
        base: Option<Version>,
        version: Version,
    ) -> Result<(Digest, TreeUpdateBatch), Error> {
        if let Some(base) = base {
            if version < base {
                return Err(Error::VersionRegression { base, version });
            }
        }
        let mut updates: Vec<Update> = value_set
            .into_iter()
            .map(|(key, value)| (hash(&key), value.map(|value| LeafNode::new(key, value))))
            .collect();
        updates.sort_by(|a, b| a.0.cmp(&b.0));
        if updates.windows(2).any(|pair| pair[0].0 == pair[1].0) {
            return Err(Error::DuplicateKey);
        }

        let existing = base.map(|base| self.root(base)).transpose()?;
        let mut builder = Builder {
            reader: self.reader,
            version,
            batch: TreeUpdateBatch::default(),
        };
        let root_key = NodeKey::root(version);

        // Carry the previous root forward unchanged
        if updates.is_empty() {
            let Some((key, node)) = existing else {
                builder.write(root_key, Node::Null);
                return Ok((PLACEHOLDER, builder.batch));
            };
            let hash = node.hash();
            if key != root_key {
                builder.retire(key);
                builder.write(root_key, node);
            }
            return Ok((hash, builder.batch));
        }

        let hash = match builder.update(&NibblePath::new(), existing, &updates)? {
            Subtree::Empty => {
                builder.write(root_key, Node::Null);
                PLACEHOLDER
            }
            Subtree::Leaf { leaf, at } => {
                if let Some(at) = at {
                    if at != root_key {
                        builder.retire(at);
                    }
                }
                let hash = leaf.hash();
                builder.write(root_key, Node::Leaf(leaf));
                hash
            }
            Subtree::Internal(hash) => hash,
            Subtree::Unchanged(child) => child.hash,
        };
        Ok((hash, builder.batch))
    }

    /// Value of `key` at `version`.
    pub fn get(&self, key: &[u8], version: Version) -> Result<Option<Bytes>, Error> {
        let (leaf, _) = self.get_with_proof(&hash(key), version)?;
        Ok(leaf.map(|leaf| leaf.value().clone()))
    }

    /// The leaf with `key_digest` at `version` (if present) and a proof of its inclusion or
    /// exclusion.
    pub fn get_with_proof(
        &self,
        key_digest: &Digest,
        version: Version,
    ) -> Result<(Option<LeafNode>, SparseMerkleProof), Error> {
        let mut siblings = Vec::new();
        let (mut key, mut node) = self.root(version)?;
        loop {
            let internal = match node {
                Node::Null => return Ok((None, SparseMerkleProof::new(None, siblings))),
                Node::Leaf(leaf) => {
                    let proof = SparseMerkleProof::new(
                        Some((*leaf.key_digest(), leaf.value_hash())),
                        siblings,
                    );
                    let found = (leaf.key_digest() == key_digest).then_some(leaf);
                    return Ok((found, proof));
                }
                Node::Internal(internal) => internal,
            };

            // Descend the binary tree inside the node until a single child remains
            let nibble = key_digest.nibble(key.path.len());
            let (mut start, mut width) = (0u8, 16u8);
            let (next, child) = loop {
                match internal.count(start, width) {
                    0 => return Ok((None, SparseMerkleProof::new(None, siblings))),
                    1 => {
                        if let Some((n, child)) = internal.only(start, width) {
                            if child.leaf || width == 1 {
                                break (n, child.clone());
                            }
                        }
                    }
                    _ => {}
                }
                let half = width / 2;
                if nibble < start + half {
                    siblings.push(internal.merkle_hash(start + half, half));
                } else {
                    siblings.push(internal.merkle_hash(start, half));
                    start += half;
                }
                width = half;
            };
            key = NodeKey::new(child.version, key.path.child(next));
            node = self.reader.get_node(&key)?;
        }
    }

    /// Leaves with key digests in `[start, end]` at `version`, in digest order.
    ///
    /// Stops before exceeding `max_items` leaves or `max_bytes` of keys and values, but always
    /// returns at least one leaf if any exist in the range.
    pub fn get_range(
        &self,
        version: Version,
        start: &Digest,
        end: &Digest,
        max_items: usize,
        max_bytes: usize,
    ) -> Result<RangeRead, Error> {
        let (key, node) = self.root(version)?;
        let mut collector = Collector {
            start,
            end,
            max_items,
            max_bytes,
            bytes: 0,
            leaves: Vec::new(),
        };
        let truncated = self.collect(&key, node, &mut collector)?;
        let last = match (truncated, collector.leaves.last()) {
            (true, Some(leaf)) => *leaf.key_digest(),
            _ => *end,
        };
        Ok(RangeRead {
            leaves: collector.leaves,
            last,
            truncated,
        })
    }

    /// Returns true if the collector filled up before visiting every leaf in range.
    fn collect(&self, key: &NodeKey, node: Node, collector: &mut Collector) -> Result<bool, Error> {
        match node {
            Node::Null => Ok(false),
            Node::Leaf(leaf) => Ok(!collector.push(leaf)),
            Node::Internal(internal) => {
                for (nibble, child) in internal.children() {
                    let path = key.path.child(nibble);
                    if path.max_digest() < *collector.start || path.min_digest() > *collector.end
                    {
                        continue;
                    }
                    let child_key = NodeKey::new(child.version, path);
                    let node = self.reader.get_node(&child_key)?;
                    if self.collect(&child_key, node, collector)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Proofs for the boundaries of `[start, end]` at `version`.
    ///
    /// Together with the leaves returned by [Self::get_range] over the same range, this lets a
    /// verifier check that no leaf was added, altered, or omitted (see [super::verify_subrange]).
    pub fn prove_subrange(
        &self,
        version: Version,
        start: &Digest,
        end: &Digest,
    ) -> Result<SubrangeProof, Error> {
        let (_, left) = self.get_with_proof(start, version)?;
        let (_, right) = self.get_with_proof(end, version)?;
        Ok(SubrangeProof { left, right })
    }
}

struct Collector<'a> {
    start: &'a Digest,
    end: &'a Digest,
    max_items: usize,
    max_bytes: usize,
    bytes: usize,
    leaves: Vec<LeafNode>,
}

impl Collector<'_> {
    /// Returns false if `leaf` is in range but does not fit.
    fn push(&mut self, leaf: LeafNode) -> bool {
        if leaf.key_digest() < self.start || leaf.key_digest() > self.end {
            return true;
        }
        let size = leaf.key().len() + leaf.value().len();
        if !self.leaves.is_empty()
            && (self.leaves.len() >= self.max_items || self.bytes + size > self.max_bytes)
        {
            return false;
        }
        self.bytes += size;
        self.leaves.push(leaf);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jmt::{collapsed_hash, MockTreeStore, TreeWriter};
    use rand::{rngs::StdRng, Rng, SeedableRng};

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn apply(
        store: &mut MockTreeStore,
        updates: Vec<(Bytes, Option<Bytes>)>,
        base: Option<Version>,
        version: Version,
    ) -> Digest {
        let (root, batch) = JellyfishMerkleTree::new(&*store)
            .put_value_set(updates, base, version)
            .unwrap();
        store.write_node_batch(&batch).unwrap();
        root
    }

    fn reference(state: &BTreeMap<Bytes, Bytes>) -> Digest {
        let mut leaves: Vec<(Digest, Digest)> =
            state.iter().map(|(k, v)| (hash(k), hash(v))).collect();
        leaves.sort();
        collapsed_hash(&leaves, 0)
    }

    #[test]
    fn test_empty_tree() {
        let mut store = MockTreeStore::default();
        let root = apply(&mut store, vec![], None, 0);
        assert_eq!(root, PLACEHOLDER);
        let tree = JellyfishMerkleTree::new(&store);
        assert_eq!(tree.get_root_hash(0).unwrap(), PLACEHOLDER);
        assert_eq!(tree.get(b"missing", 0).unwrap(), None);
        assert!(matches!(tree.get_root_hash(1), Err(Error::MissingRoot(1))));
    }

    #[test]
    fn test_insert_then_delete_matches_fresh_tree() {
        let mut store = MockTreeStore::default();
        apply(
            &mut store,
            vec![(b("a"), Some(b("1"))), (b("b"), Some(b("2")))],
            None,
            1,
        );
        let after_delete = apply(&mut store, vec![(b("a"), None)], Some(1), 2);

        let mut fresh = MockTreeStore::default();
        let expected = apply(&mut fresh, vec![(b("b"), Some(b("2")))], None, 1);
        assert_eq!(after_delete, expected);

        // Both keys in one batch as well
        let mut same_batch = MockTreeStore::default();
        apply(&mut same_batch, vec![(b("a"), Some(b("1")))], None, 1);
        let root = apply(
            &mut same_batch,
            vec![(b("a"), None), (b("b"), Some(b("2")))],
            Some(1),
            2,
        );
        assert_eq!(root, expected);
    }

    #[test]
    fn test_matches_reference_over_many_versions() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = MockTreeStore::default();
        let mut state = BTreeMap::new();
        let mut base = None;
        for version in 1..=30u64 {
            let mut updates = BTreeMap::new();
            for _ in 0..rng.gen_range(0..20) {
                let key = b(&format!("key-{}", rng.gen_range(0..60)));
                let value = if rng.gen_bool(0.3) {
                    None
                } else {
                    Some(b(&format!("value-{}", rng.gen::<u32>())))
                };
                updates.insert(key, value);
            }
            for (key, value) in updates.iter() {
                match value {
                    Some(value) => state.insert(key.clone(), value.clone()),
                    None => state.remove(key),
                };
            }
            let root = apply(&mut store, updates.into_iter().collect(), base, version);
            assert_eq!(root, reference(&state), "version {version}");
            base = Some(version);
        }

        let tree = JellyfishMerkleTree::new(&store);
        for (key, value) in state.iter() {
            assert_eq!(tree.get(key, 30).unwrap().as_ref(), Some(value));
        }
    }

    #[test]
    fn test_historical_versions_readable() {
        let mut store = MockTreeStore::default();
        let v1 = apply(&mut store, vec![(b("a"), Some(b("1")))], None, 1);
        let v2 = apply(&mut store, vec![(b("a"), Some(b("2")))], Some(1), 2);
        let tree = JellyfishMerkleTree::new(&store);
        assert_eq!(tree.get_root_hash(1).unwrap(), v1);
        assert_eq!(tree.get_root_hash(2).unwrap(), v2);
        assert_eq!(tree.get(b"a", 1).unwrap(), Some(b("1")));
        assert_eq!(tree.get(b"a", 2).unwrap(), Some(b("2")));
    }

    #[test]
    fn test_purge_keeps_latest() {
        let mut store = MockTreeStore::default();
        let keys: Vec<_> = (0..50).map(|i| (b(&format!("{i}")), Some(b("x")))).collect();
        apply(&mut store, keys, None, 1);
        let root = apply(&mut store, vec![(b("7"), Some(b("y")))], Some(1), 2);
        assert!(store.num_stale() > 0);
        store.purge_stale_nodes(2);
        assert_eq!(store.num_stale(), 0);

        let tree = JellyfishMerkleTree::new(&store);
        assert_eq!(tree.get_root_hash(2).unwrap(), root);
        for i in 0..50 {
            assert!(tree.get(format!("{i}").as_bytes(), 2).unwrap().is_some());
        }
    }

    #[test]
    fn test_same_version_updates_delete_replaced_nodes() {
        let mut store = MockTreeStore::default();
        apply(&mut store, vec![], None, 5);
        apply(&mut store, vec![(b("a"), Some(b("1")))], Some(5), 5);
        let root = apply(&mut store, vec![(b("b"), Some(b("2")))], Some(5), 5);
        assert_eq!(store.num_stale(), 0);

        let mut fresh = MockTreeStore::default();
        let expected = apply(
            &mut fresh,
            vec![(b("a"), Some(b("1"))), (b("b"), Some(b("2")))],
            None,
            5,
        );
        assert_eq!(root, expected);
        assert_eq!(store.num_nodes(), fresh.num_nodes());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let store = MockTreeStore::default();
        let result = JellyfishMerkleTree::new(&store).put_value_set(
            vec![(b("a"), Some(b("1"))), (b("a"), None)],
            None,
            1,
        );
        assert!(matches!(result, Err(Error::DuplicateKey)));
    }

    #[test]
    fn test_version_regression_rejected() {
        let mut store = MockTreeStore::default();
        apply(&mut store, vec![(b("a"), Some(b("1")))], None, 3);
        let result =
            JellyfishMerkleTree::new(&store).put_value_set(vec![(b("b"), None)], Some(3), 2);
        assert!(matches!(
            result,
            Err(Error::VersionRegression {
                base: 3,
                version: 2
            })
        ));
    }

    #[test]
    fn test_get_range_truncates() {
        let mut store = MockTreeStore::default();
        let keys: Vec<_> = (0..20).map(|i| (b(&format!("k{i}")), Some(b("v")))).collect();
        apply(&mut store, keys, None, 1);
        let tree = JellyfishMerkleTree::new(&store);

        let all = tree
            .get_range(1, &Digest::ZERO, &Digest::MAX, usize::MAX, usize::MAX)
            .unwrap();
        assert_eq!(all.leaves.len(), 20);
        assert!(!all.truncated);
        assert_eq!(all.last, Digest::MAX);
        assert!(all
            .leaves
            .windows(2)
            .all(|pair| pair[0].key_digest() < pair[1].key_digest()));

        let first = tree
            .get_range(1, &Digest::ZERO, &Digest::MAX, 5, usize::MAX)
            .unwrap();
        assert_eq!(first.leaves.len(), 5);
        assert!(first.truncated);
        assert_eq!(first.last, *first.leaves[4].key_digest());

        // Resume after the last leaf
        let rest = tree
            .get_range(1, &first.last.successor().unwrap(), &Digest::MAX, 100, 8)
            .unwrap();
        assert!(rest.truncated);
        assert_eq!(rest.leaves.len(), 2);
        assert_eq!(rest.leaves[0], all.leaves[5]);
    }
}
