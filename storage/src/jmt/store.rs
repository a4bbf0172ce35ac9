//! Where tree nodes live.

use super::{Error, Node, NodeKey, StaleNodeIndex, TreeUpdateBatch, Version};
use crate::kv::{self, Transaction};
use bytes::Bytes;
use ocr_codec::{DecodeExt, Encode};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

const NODE_PREFIX: &[u8] = b"jmt/node/";
const STALE_PREFIX: &[u8] = b"jmt/stale/";
const TREE_PREFIX: &[u8] = b"jmt/";

/// Read nodes of the tree.
pub trait TreeReader {
    /// Get the node stored at `key`, if any.
    fn get_node_option(&self, key: &NodeKey) -> Result<Option<Node>, Error>;

    /// Get the node stored at `key`, failing if it is absent.
    fn get_node(&self, key: &NodeKey) -> Result<Node, Error> {
        self.get_node_option(key)?
            .ok_or_else(|| Error::MissingNode(key.clone()))
    }
}

/// Persist the output of a tree update.
pub trait TreeWriter {
    /// Delete the nodes `batch` removes, then write its new nodes and stale node records.
    fn write_node_batch(&mut self, batch: &TreeUpdateBatch) -> Result<(), Error>;
}

fn node_key(key: &NodeKey) -> Vec<u8> {
    let mut out = NODE_PREFIX.to_vec();
    out.extend_from_slice(&key.encode());
    out
}

fn stale_key(index: &StaleNodeIndex) -> Vec<u8> {
    let mut out = STALE_PREFIX.to_vec();
    out.extend_from_slice(&index.encode());
    out
}

impl TreeReader for Transaction {
    fn get_node_option(&self, key: &NodeKey) -> Result<Option<Node>, Error> {
        let Some(raw) = self.get(&node_key(key))? else {
            return Ok(None);
        };
        Ok(Some(Node::decode(raw)?))
    }
}

impl TreeWriter for Transaction {
    fn write_node_batch(&mut self, batch: &TreeUpdateBatch) -> Result<(), Error> {
        for key in batch.deleted.iter() {
            self.delete(&node_key(key))?;
        }
        for (key, node) in batch.nodes.iter() {
            self.put(node_key(key), node.encode().freeze())?;
        }
        for index in batch.stale.iter() {
            self.put(stale_key(index), Bytes::new())?;
        }
        Ok(())
    }
}

/// Delete up to `limit` nodes that became stale at or before `version`.
///
/// Returns the number of nodes deleted. Once this returns fewer than `limit`, no nodes stale at or
/// before `version` remain.
pub fn purge_stale_nodes(
    txn: &mut Transaction,
    version: Version,
    limit: usize,
) -> Result<usize, Error> {
    let mut end = STALE_PREFIX.to_vec();
    end.extend_from_slice(&(version.saturating_add(1)).to_be_bytes());
    let entries = if version == Version::MAX {
        txn.scan_prefix(STALE_PREFIX, limit)?
    } else {
        txn.range(STALE_PREFIX, Some(&end), limit)?
    };
    for (raw, _) in entries.iter() {
        let index = StaleNodeIndex::decode(&raw[STALE_PREFIX.len()..])?;
        txn.delete(&node_key(&index.node_key))?;
        txn.delete(raw)?;
    }
    if !entries.is_empty() {
        debug!(version, purged = entries.len(), "purged stale nodes");
    }
    Ok(entries.len())
}

/// Delete every node and stale node record.
pub fn wipe(txn: &mut Transaction) -> Result<usize, kv::Error> {
    txn.delete_prefix(TREE_PREFIX)
}

/// An in-memory node store.
#[derive(Default)]
pub struct MockTreeStore {
    nodes: BTreeMap<NodeKey, Node>,
    stale: BTreeSet<StaleNodeIndex>,
}

impl MockTreeStore {
    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_stale(&self) -> usize {
        self.stale.len()
    }

    /// Delete all nodes that became stale at or before `version`.
    pub fn purge_stale_nodes(&mut self, version: Version) -> usize {
        let mut purged = 0;
        while let Some(index) = self.stale.pop_first() {
            if index.stale_since_version > version {
                self.stale.insert(index);
                break;
            }
            self.nodes.remove(&index.node_key);
            purged += 1;
        }
        purged
    }
}

impl TreeReader for MockTreeStore {
    fn get_node_option(&self, key: &NodeKey) -> Result<Option<Node>, Error> {
        Ok(self.nodes.get(key).cloned())
    }
}

impl TreeWriter for MockTreeStore {
    fn write_node_batch(&mut self, batch: &TreeUpdateBatch) -> Result<(), Error> {
        for key in batch.deleted.iter() {
            self.nodes.remove(key);
        }
        for (key, node) in batch.nodes.iter() {
            self.nodes.insert(key.clone(), node.clone());
        }
        self.stale.extend(batch.stale.iter().cloned());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{jmt::JellyfishMerkleTree, kv::Database};

    fn put(db: &Database, base: Option<Version>, version: Version, keys: &[&'static str]) {
        let mut txn = db.serialized_transaction();
        let updates = keys
            .iter()
            .map(|k| (Bytes::from_static(k.as_bytes()), Some(Bytes::from(format!("{k}{version}")))))
            .collect();
        let (_, batch) = JellyfishMerkleTree::new(&txn)
            .put_value_set(updates, base, version)
            .unwrap();
        txn.write_node_batch(&batch).unwrap();
        txn.commit().unwrap();
    }

    #[test]
    fn test_kv_store_purge() {
        let db = Database::new();
        put(&db, None, 1, &["a", "b", "c"]);
        put(&db, Some(1), 2, &["a"]);
        put(&db, Some(2), 3, &["b"]);

        // Version 1 is only readable until its stale nodes are purged
        let mut txn = db.serialized_transaction();
        assert!(JellyfishMerkleTree::new(&txn).get_root_hash(1).is_ok());
        let purged = purge_stale_nodes(&mut txn, 2, usize::MAX).unwrap();
        assert!(purged > 0);
        txn.commit().unwrap();

        let txn = db.read_transaction();
        let tree = JellyfishMerkleTree::new(&txn);
        assert!(matches!(tree.get_root_hash(1), Err(Error::MissingRoot(1))));
        assert_eq!(
            tree.get(b"a", 3).unwrap(),
            Some(Bytes::from_static(b"a2"))
        );
        assert_eq!(
            tree.get(b"c", 3).unwrap(),
            Some(Bytes::from_static(b"c1"))
        );
    }

    #[test]
    fn test_purge_respects_limit() {
        let db = Database::new();
        put(&db, None, 1, &["a", "b", "c", "d"]);
        put(&db, Some(1), 2, &["a", "b", "c", "d"]);
        let mut txn = db.serialized_transaction();
        assert_eq!(purge_stale_nodes(&mut txn, 2, 1).unwrap(), 1);
        txn.commit().unwrap();
    }

    #[test]
    fn test_wipe() {
        let db = Database::new();
        put(&db, None, 1, &["a", "b"]);
        let mut txn = db.serialized_transaction();
        assert!(wipe(&mut txn).unwrap() > 0);
        txn.commit().unwrap();
        assert!(db.is_empty().unwrap());
    }
}
