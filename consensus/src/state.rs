//! Persisted protocol state and the authenticated key-value state it gates.
//!
//! Everything lives in one [Database] so that a block, the writes it makes, the new
//! [StateRootDigest] and the committed bookmark are updated in a single transaction.
//!
//! | Key                         | Value                                    |
//! |-----------------------------|------------------------------------------|
//! | `ocr/pacemaker`             | [PacemakerState]                         |
//! | `ocr/highest_certified`     | [CertifiedPrepareOrCommit]               |
//! | `ocr/committed`             | [Committed]                              |
//! | `ocr/block/<seq_nr>`        | [AttestedStateTransitionBlock]           |
//! | `state/<key>`               | application value                        |
//! | `jmt/...`                   | tree nodes (see [ocr_storage::jmt])      |
//!
//! [Database]: ocr_storage::kv::Database

use crate::{
    plugin::Limits,
    types::{
        AttestedStateTransitionBlock, CertifiedPrepareOrCommit, HistoryDigest,
        StateRootDigest, StateTransitionBlock, WriteSet,
    },
    Error,
};
use bytes::{Buf, BufMut, Bytes};
use ocr_codec::{Decode, DecodeExt, Encode, Error as CodecError, FixedSize, Read, ReadExt, Write};
use ocr_cryptography::Digest;
use ocr_storage::{
    jmt::{JellyfishMerkleTree, TreeUpdateBatch, TreeWriter, Version},
    kv::{self, prefix_end, Transaction},
};
use ocr_utils::{ConfigDigest, Epoch, SeqNr};

const PACEMAKER_KEY: &[u8] = b"ocr/pacemaker";
const HIGHEST_CERTIFIED_KEY: &[u8] = b"ocr/highest_certified";
const COMMITTED_KEY: &[u8] = b"ocr/committed";
const BLOCK_PREFIX: &[u8] = b"ocr/block/";
const STATE_PREFIX: &[u8] = b"state/";

fn state_key(key: &[u8]) -> Vec<u8> {
    let mut full = STATE_PREFIX.to_vec();
    full.extend_from_slice(key);
    full
}

fn block_key(seq_nr: SeqNr) -> Vec<u8> {
    let mut key = BLOCK_PREFIX.to_vec();
    key.extend_from_slice(&seq_nr.to_be_bytes());
    key
}

fn block_seq_nr(key: &[u8]) -> Result<SeqNr, kv::Error> {
    let raw: [u8; 8] = key[BLOCK_PREFIX.len()..]
        .try_into()
        .map_err(|_| kv::Error::Corrupt("block key"))?;
    Ok(SeqNr::from_be_bytes(raw))
}

/// Application value of `key` in the committed state.
pub fn read_value(txn: &Transaction, key: &[u8]) -> Result<Option<Bytes>, kv::Error> {
    txn.get(&state_key(key))
}

pub fn write_value(
    txn: &mut Transaction,
    key: &[u8],
    value: Option<Bytes>,
) -> Result<(), kv::Error> {
    match value {
        Some(value) => txn.put(state_key(key), value),
        None => txn.delete(&state_key(key)),
    }
}

/// Remove every application value.
pub fn wipe_values(txn: &mut Transaction) -> Result<usize, kv::Error> {
    txn.delete_prefix(STATE_PREFIX)
}

/// Epochs the pacemaker has entered and asked for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacemakerState {
    pub epoch: Epoch,
    pub highest_sent_new_epoch_wish: Epoch,
}

impl Write for PacemakerState {
    fn write(&self, buf: &mut impl BufMut) {
        self.epoch.write(buf);
        self.highest_sent_new_epoch_wish.write(buf);
    }
}

impl Read for PacemakerState {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let epoch = Epoch::read(buf)?;
        let highest_sent_new_epoch_wish = Epoch::read(buf)?;
        Ok(Self {
            epoch,
            highest_sent_new_epoch_wish,
        })
    }
}

impl FixedSize for PacemakerState {
    const SIZE: usize = Epoch::SIZE * 2;
}

pub fn read_pacemaker_state(txn: &Transaction) -> Result<PacemakerState, Error> {
    match txn.get(PACEMAKER_KEY)? {
        Some(raw) => Ok(PacemakerState::decode(raw)?),
        None => Ok(PacemakerState::default()),
    }
}

pub fn write_pacemaker_state(txn: &mut Transaction, state: &PacemakerState) -> Result<(), Error> {
    txn.put(PACEMAKER_KEY, state.encode().freeze())?;
    Ok(())
}

pub fn read_highest_certified(
    txn: &Transaction,
    limits: &Limits,
) -> Result<CertifiedPrepareOrCommit, Error> {
    match txn.get(HIGHEST_CERTIFIED_KEY)? {
        Some(raw) => Ok(CertifiedPrepareOrCommit::decode_cfg(raw, limits)?),
        None => Ok(CertifiedPrepareOrCommit::Genesis),
    }
}

pub fn write_highest_certified(
    txn: &mut Transaction,
    certified: &CertifiedPrepareOrCommit,
) -> Result<(), Error> {
    txn.put(HIGHEST_CERTIFIED_KEY, certified.encode().freeze())?;
    Ok(())
}

/// The last state transition applied to the key-value state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Committed {
    pub seq_nr: SeqNr,
    pub history_digest: HistoryDigest,
}

impl Write for Committed {
    fn write(&self, buf: &mut impl BufMut) {
        self.seq_nr.write(buf);
        self.history_digest.write(buf);
    }
}

impl Read for Committed {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let seq_nr = SeqNr::read(buf)?;
        let history_digest = Digest::read(buf)?;
        Ok(Self {
            seq_nr,
            history_digest,
        })
    }
}

impl FixedSize for Committed {
    const SIZE: usize = SeqNr::SIZE + Digest::SIZE;
}

pub fn read_committed(txn: &Transaction) -> Result<Committed, Error> {
    match txn.get(COMMITTED_KEY)? {
        Some(raw) => Ok(Committed::decode(raw)?),
        None => Ok(Committed::default()),
    }
}

pub fn write_committed(txn: &mut Transaction, committed: &Committed) -> Result<(), Error> {
    txn.put(COMMITTED_KEY, committed.encode().freeze())?;
    Ok(())
}

pub fn write_block(
    txn: &mut Transaction,
    block: &AttestedStateTransitionBlock,
) -> Result<(), Error> {
    txn.put(block_key(block.block.seq_nr), block.encode().freeze())?;
    Ok(())
}

pub fn read_block(
    txn: &Transaction,
    seq_nr: SeqNr,
    limits: &Limits,
) -> Result<Option<AttestedStateTransitionBlock>, Error> {
    match txn.get(&block_key(seq_nr))? {
        Some(raw) => Ok(Some(AttestedStateTransitionBlock::decode_cfg(raw, limits)?)),
        None => Ok(None),
    }
}

/// Up to `limit` consecutive blocks starting at `from`.
pub fn read_blocks(
    txn: &Transaction,
    from: SeqNr,
    limit: usize,
    limits: &Limits,
) -> Result<Vec<AttestedStateTransitionBlock>, Error> {
    let end = prefix_end(BLOCK_PREFIX);
    let entries = txn.range(&block_key(from), end.as_deref(), limit)?;
    let mut blocks = Vec::with_capacity(entries.len());
    for (expected, (key, raw)) in (from..).zip(entries) {
        if block_seq_nr(&key)? != expected {
            break;
        }
        blocks.push(AttestedStateTransitionBlock::decode_cfg(raw, limits)?);
    }
    Ok(blocks)
}

/// Lowest and highest persisted block, if any.
pub fn persisted_range(txn: &Transaction) -> Result<Option<(SeqNr, SeqNr)>, Error> {
    let Some((first, _)) = txn.scan_prefix(BLOCK_PREFIX, 1)?.into_iter().next() else {
        return Ok(None);
    };
    let lowest = block_seq_nr(&first)?;
    let mut highest = lowest;
    // Blocks are persisted gap-free, so walk forward in pages
    loop {
        let page = txn.range(&block_key(highest + 1), prefix_end(BLOCK_PREFIX).as_deref(), 256)?;
        let Some((last, _)) = page.last() else {
            break;
        };
        highest = block_seq_nr(last)?;
    }
    Ok(Some((lowest, highest)))
}

/// Delete every block below `seq_nr`. Returns the number deleted.
pub fn prune_blocks(txn: &mut Transaction, seq_nr: SeqNr) -> Result<usize, Error> {
    let entries = txn.range(BLOCK_PREFIX, Some(&block_key(seq_nr)), usize::MAX)?;
    for (key, _) in entries.iter() {
        txn.delete(key)?;
    }
    Ok(entries.len())
}

/// Version of the tree a state transition at `seq_nr` builds on.
fn base_version(txn: &Transaction, seq_nr: SeqNr) -> Result<Option<Version>, Error> {
    let Some(previous) = seq_nr.checked_sub(1) else {
        return Ok(None);
    };
    let tree = JellyfishMerkleTree::new(txn);
    Ok(tree.get_root_hash_option(previous)?.map(|_| previous))
}

/// Compute the state root that applying `write_set` at `seq_nr` would produce, without writing.
pub fn compute_state_root(
    txn: &Transaction,
    seq_nr: SeqNr,
    write_set: &WriteSet,
) -> Result<(StateRootDigest, TreeUpdateBatch), Error> {
    let base = base_version(txn, seq_nr)?;
    let tree = JellyfishMerkleTree::new(txn);
    Ok(tree.put_value_set(write_set.clone().into_inner(), base, seq_nr)?)
}

/// State root after the state transition at `seq_nr`.
pub fn state_root(txn: &Transaction, seq_nr: SeqNr) -> Result<Option<StateRootDigest>, Error> {
    Ok(JellyfishMerkleTree::new(txn).get_root_hash_option(seq_nr)?)
}

/// Apply the next block to the key-value state.
///
/// Fails without writing if `block` does not directly extend the committed state or produces a
/// different state root than it claims.
pub fn apply_block(
    txn: &mut Transaction,
    config_digest: &ConfigDigest,
    block: &StateTransitionBlock,
) -> Result<Committed, Error> {
    let committed = read_committed(txn)?;
    if block.seq_nr != committed.seq_nr + 1 {
        return Err(Error::OutOfOrder {
            expected: committed.seq_nr + 1,
            got: block.seq_nr,
        });
    }
    if block.prev_history_digest != committed.history_digest {
        return Err(Error::HistoryMismatch(block.seq_nr));
    }
    let (root, batch) = compute_state_root(txn, block.seq_nr, &block.write_set)?;
    if root != block.state_root {
        return Err(Error::RootMismatch(block.seq_nr));
    }

    txn.write_node_batch(&batch)?;
    for (key, value) in block.write_set.iter() {
        write_value(txn, key, value.clone())?;
    }
    let committed = Committed {
        seq_nr: block.seq_nr,
        history_digest: block.digest(config_digest),
    };
    write_committed(txn, &committed)?;
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CertifiedBlock, StateTransitionBlock};
    use ocr_cryptography::hash;
    use ocr_storage::kv::Database;
    use std::collections::BTreeMap;

    const CONFIG: ConfigDigest = ConfigDigest([3u8; 32]);

    fn write_set(entries: &[(&'static [u8], Option<&'static [u8]>)]) -> WriteSet {
        WriteSet::new(
            entries
                .iter()
                .map(|(k, v)| (Bytes::from_static(k), v.map(Bytes::from_static)))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    /// Build the block at `committed.seq_nr + 1` with a correct state root.
    fn next_block(txn: &Transaction, write_set: WriteSet) -> StateTransitionBlock {
        let committed = read_committed(txn).unwrap();
        let seq_nr = committed.seq_nr + 1;
        let (state_root, _) = compute_state_root(txn, seq_nr, &write_set).unwrap();
        StateTransitionBlock {
            epoch: 1,
            seq_nr,
            prev_history_digest: committed.history_digest,
            inputs_digest: hash(&seq_nr.to_be_bytes()),
            write_set,
            state_root,
            reports_plus_precursor: Bytes::new(),
        }
    }

    #[test]
    fn test_apply_sequence() {
        let db = Database::new();
        let mut txn = db.serialized_transaction();
        let first = next_block(&txn, write_set(&[(b"a", Some(b"1")), (b"b", Some(b"2"))]));
        apply_block(&mut txn, &CONFIG, &first).unwrap();
        let second = next_block(&txn, write_set(&[(b"a", None)]));
        let committed = apply_block(&mut txn, &CONFIG, &second).unwrap();
        txn.commit().unwrap();

        let txn = db.read_transaction();
        assert_eq!(committed.seq_nr, 2);
        assert_eq!(read_committed(&txn).unwrap(), committed);
        assert_eq!(read_value(&txn, b"a").unwrap(), None);
        assert_eq!(read_value(&txn, b"b").unwrap(), Some(Bytes::from_static(b"2")));
        assert_eq!(state_root(&txn, 2).unwrap(), Some(second.state_root));
    }

    #[test]
    fn test_apply_rejects_gap_and_bad_root() {
        let db = Database::new();
        let mut txn = db.serialized_transaction();
        let mut block = next_block(&txn, write_set(&[(b"a", Some(b"1"))]));

        block.seq_nr = 2;
        assert!(matches!(
            apply_block(&mut txn, &CONFIG, &block),
            Err(Error::OutOfOrder { expected: 1, got: 2 })
        ));

        block.seq_nr = 1;
        block.state_root = hash(b"wrong");
        assert!(matches!(
            apply_block(&mut txn, &CONFIG, &block),
            Err(Error::RootMismatch(1))
        ));

        block.state_root = Digest::ZERO;
        block.prev_history_digest = hash(b"fork");
        assert!(matches!(
            apply_block(&mut txn, &CONFIG, &block),
            Err(Error::HistoryMismatch(1))
        ));
        assert_eq!(read_committed(&txn).unwrap(), Committed::default());
    }

    #[test]
    fn test_blocks() {
        let db = Database::new();
        let mut txn = db.unserialized_transaction();
        assert_eq!(persisted_range(&txn).unwrap(), None);
        for seq_nr in [3, 4, 5, 7] {
            let block = CertifiedBlock {
                block: StateTransitionBlock {
                    epoch: 1,
                    seq_nr,
                    prev_history_digest: Digest::ZERO,
                    inputs_digest: Digest::ZERO,
                    write_set: WriteSet::default(),
                    state_root: Digest::ZERO,
                    reports_plus_precursor: Bytes::new(),
                },
                signatures: Vec::new(),
            };
            write_block(&mut txn, &block).unwrap();
        }
        let limits = Limits::default();

        // Reads stop at the first gap
        let blocks = read_blocks(&txn, 3, 10, &limits).unwrap();
        let seq_nrs: Vec<_> = blocks.iter().map(|b| b.block.seq_nr).collect();
        assert_eq!(seq_nrs, vec![3, 4, 5]);
        assert_eq!(read_blocks(&txn, 4, 1, &limits).unwrap().len(), 1);
        assert!(read_block(&txn, 6, &limits).unwrap().is_none());

        assert_eq!(prune_blocks(&mut txn, 5).unwrap(), 2);
        assert!(read_block(&txn, 4, &limits).unwrap().is_none());
        assert_eq!(persisted_range(&txn).unwrap().map(|(low, _)| low), Some(5));
    }

    #[test]
    fn test_bookmarks_default() {
        let db = Database::new();
        let txn = db.read_transaction();
        assert_eq!(read_pacemaker_state(&txn).unwrap(), PacemakerState::default());
        assert_eq!(
            read_highest_certified(&txn, &Limits::default()).unwrap(),
            CertifiedPrepareOrCommit::Genesis
        );
        assert_eq!(read_committed(&txn).unwrap().seq_nr, 0);
    }
}
