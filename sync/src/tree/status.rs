//! Progress of tree-sync, persisted so that a restart resumes where it stopped.

use crate::Error;
use bytes::{Buf, BufMut};
use ocr_codec::{DecodeExt, Encode, EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use ocr_consensus::types::StateRootDigest;
use ocr_cryptography::Digest;
use ocr_storage::kv::Transaction;
use ocr_utils::SeqNr;

const STATUS_KEY: &[u8] = b"sync/tree";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    /// Not syncing.
    #[default]
    Inactive,

    /// A target was chosen but its attested block (and so its state root) is not known yet.
    Waiting,

    /// Fetching the key space of the target.
    Active,
}

impl Phase {
    fn tag(&self) -> u8 {
        match self {
            Phase::Inactive => 0,
            Phase::Waiting => 1,
            Phase::Active => 2,
        }
    }
}

/// Persisted tree-sync progress.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeSyncStatus {
    pub phase: Phase,
    pub target_seq_nr: SeqNr,

    /// Zero until the phase is [Phase::Active].
    pub target_state_root: StateRootDigest,

    /// Key digest ranges still to fetch, sorted and disjoint.
    pub pending: Vec<(Digest, Digest)>,
}

impl TreeSyncStatus {
    pub fn waiting(target_seq_nr: SeqNr) -> Self {
        Self {
            phase: Phase::Waiting,
            target_seq_nr,
            ..Default::default()
        }
    }

    /// Start fetching the key space, split into `ranges` ranges of equal width.
    pub fn active(target_seq_nr: SeqNr, target_state_root: StateRootDigest, ranges: usize) -> Self {
        Self {
            phase: Phase::Active,
            target_seq_nr,
            target_state_root,
            pending: split(ranges),
        }
    }

    /// Record that `[start, last]` was fetched.
    ///
    /// Returns false if `start` does not begin a pending range or `last` lies outside it.
    pub fn advance(&mut self, start: &Digest, last: &Digest) -> bool {
        let Some(index) = self.pending.iter().position(|(s, _)| s == start) else {
            return false;
        };
        let (_, end) = self.pending[index];
        if last < start || *last > end {
            return false;
        }
        match last.successor() {
            Some(next) if *last < end => self.pending[index].0 = next,
            _ => {
                self.pending.remove(index);
            }
        }
        true
    }
}

/// Split the key digest space into `ranges` contiguous ranges by their leading bytes.
fn split(ranges: usize) -> Vec<(Digest, Digest)> {
    let ranges = ranges.clamp(1, 1 << 16) as u64;
    let width = (1u64 << 16).div_ceil(ranges);
    let mut pending = Vec::new();
    let mut prefix = 0u64;
    while prefix < 1 << 16 {
        let last = (prefix + width).min(1 << 16) - 1;
        let mut start = Digest::ZERO;
        start.0[..2].copy_from_slice(&(prefix as u16).to_be_bytes());
        let mut end = Digest::MAX;
        end.0[..2].copy_from_slice(&(last as u16).to_be_bytes());
        pending.push((start, end));
        prefix = last + 1;
    }
    pending
}

impl Write for TreeSyncStatus {
    fn write(&self, buf: &mut impl BufMut) {
        self.phase.tag().write(buf);
        self.target_seq_nr.write(buf);
        self.target_state_root.write(buf);
        self.pending.write(buf);
    }
}

impl EncodeSize for TreeSyncStatus {
    fn encode_size(&self) -> usize {
        1 + self.target_seq_nr.encode_size()
            + self.target_state_root.encode_size()
            + self.pending.encode_size()
    }
}

impl Read for TreeSyncStatus {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let phase = match u8::read(buf)? {
            0 => Phase::Inactive,
            1 => Phase::Waiting,
            2 => Phase::Active,
            tag => return Err(CodecError::InvalidEnum("TreeSyncStatus::phase", tag)),
        };
        let target_seq_nr = SeqNr::read(buf)?;
        let target_state_root = Digest::read(buf)?;
        let pending = Vec::read_cfg(buf, &(RangeCfg::from(..), ((), ())))?;
        Ok(Self {
            phase,
            target_seq_nr,
            target_state_root,
            pending,
        })
    }
}

pub fn read_status(txn: &Transaction) -> Result<TreeSyncStatus, Error> {
    match txn.get(STATUS_KEY)? {
        Some(raw) => Ok(TreeSyncStatus::decode(raw)?),
        None => Ok(TreeSyncStatus::default()),
    }
}

pub fn write_status(txn: &mut Transaction, status: &TreeSyncStatus) -> Result<(), Error> {
    txn.put(STATUS_KEY, status.encode().freeze())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocr_storage::kv::Database;
    use test_case::test_case;

    #[test_case(1)]
    #[test_case(3)]
    #[test_case(16)]
    #[test_case(1 << 20)]
    fn test_split_covers_key_space(ranges: usize) {
        let pending = split(ranges);
        assert_eq!(pending.first().map(|(start, _)| *start), Some(Digest::ZERO));
        assert_eq!(pending.last().map(|(_, end)| *end), Some(Digest::MAX));
        for pair in pending.windows(2) {
            assert!(pair[0].0 <= pair[0].1);
            assert_eq!(pair[0].1.successor(), Some(pair[1].0));
        }
    }

    #[test]
    fn test_advance() {
        let mut status = TreeSyncStatus::active(100, Digest::ZERO, 2);
        let (start, end) = status.pending[0];
        let mut middle = start;
        middle.0[5] = 7;

        // Only the start of a pending range is accepted, and only up to its end
        let beyond = status.pending[1].1;
        assert!(!status.advance(&middle, &end));
        assert!(!status.advance(&start, &beyond));

        assert!(status.advance(&start, &middle));
        assert_eq!(status.pending[0], (middle.successor().unwrap(), end));
        assert!(status.advance(&middle.successor().unwrap(), &end));
        assert_eq!(status.pending.len(), 1);
        let (start, end) = status.pending[0];
        assert!(status.advance(&start, &end));
        assert!(status.pending.is_empty());
    }

    #[test]
    fn test_persisted() {
        let db = Database::new();
        let mut txn = db.unserialized_transaction();
        assert_eq!(read_status(&txn).unwrap(), TreeSyncStatus::default());
        let status = TreeSyncStatus::active(1000, ocr_cryptography::hash(b"root"), 4);
        write_status(&mut txn, &status).unwrap();
        txn.commit().unwrap();
        assert_eq!(read_status(&db.read_transaction()).unwrap(), status);
    }
}
