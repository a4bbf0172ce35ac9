//! Messages exchanged while syncing, one enum per actor channel.

use bytes::{Buf, BufMut};
use ocr_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use ocr_consensus::{
    plugin,
    types::{AttestedStateTransitionBlock, CertifiedBlock},
    SharedConfig,
};
use ocr_cryptography::Digest;
use ocr_p2p::Class;
use ocr_storage::jmt::{LeafNode, SubrangeProof};
use ocr_utils::SeqNr;

/// Bounds enforced when decoding sync messages.
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub plugin: plugin::Limits,
    pub max_blocks_per_response: usize,
    pub max_chunk_keys: usize,
    pub max_chunk_bytes: usize,
}

impl Limits {
    pub fn new(shared: &SharedConfig) -> Self {
        Self {
            plugin: shared.limits,
            max_blocks_per_response: shared.max_blocks_per_response,
            max_chunk_keys: shared.max_tree_sync_chunk_keys,
            max_chunk_bytes: shared.max_tree_sync_chunk_bytes,
        }
    }

    fn leaf_cfg(&self) -> (RangeCfg, RangeCfg) {
        (
            RangeCfg::from(..=self.plugin.max_key_length),
            RangeCfg::from(..=self.plugin.max_value_length),
        )
    }
}

/// Sent by block persistence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Blocks {
    /// Ask for the attested blocks in `[from, to]`.
    BlockSyncRequest { from: SeqNr, to: SeqNr },

    /// Consecutive blocks starting at `from`, or `None` if the responder holds none of them
    /// (a go-away).
    BlockSyncResponse {
        from: SeqNr,
        blocks: Option<Vec<AttestedStateTransitionBlock>>,
    },
}

impl Blocks {
    pub fn check_size(&self, limits: &Limits, n: usize) -> bool {
        match self {
            Blocks::BlockSyncRequest { from, to } => from <= to,
            Blocks::BlockSyncResponse { blocks, .. } => blocks.as_ref().is_none_or(|blocks| {
                blocks.len() <= limits.max_blocks_per_response
                    && blocks.iter().all(|block| {
                        block.signatures.len() <= n
                            && block.block.write_set.check_size(&limits.plugin)
                            && block.block.reports_plus_precursor.len()
                                <= limits.plugin.max_reports_plus_precursor_length
                    })
            }),
        }
    }

    pub fn class(&self) -> Class {
        match self {
            Blocks::BlockSyncRequest { .. } => Class::Request,
            Blocks::BlockSyncResponse { .. } => Class::Response,
        }
    }
}

impl Write for Blocks {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Blocks::BlockSyncRequest { from, to } => {
                0u8.write(buf);
                from.write(buf);
                to.write(buf);
            }
            Blocks::BlockSyncResponse { from, blocks } => {
                1u8.write(buf);
                from.write(buf);
                blocks.write(buf);
            }
        }
    }
}

impl EncodeSize for Blocks {
    fn encode_size(&self) -> usize {
        1 + match self {
            Blocks::BlockSyncRequest { from, to } => from.encode_size() + to.encode_size(),
            Blocks::BlockSyncResponse { from, blocks } => from.encode_size() + blocks.encode_size(),
        }
    }
}

impl Read for Blocks {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => {
                let from = SeqNr::read(buf)?;
                let to = SeqNr::read(buf)?;
                Ok(Blocks::BlockSyncRequest { from, to })
            }
            1 => {
                let from = SeqNr::read(buf)?;
                let cfg = (
                    RangeCfg::from(..=limits.max_blocks_per_response),
                    limits.plugin,
                );
                let blocks = Option::<Vec<CertifiedBlock>>::read_cfg(buf, &cfg)?;
                Ok(Blocks::BlockSyncResponse { from, blocks })
            }
            tag => Err(CodecError::InvalidEnum("wire::Blocks", tag)),
        }
    }
}

/// Leaves of one key digest range and the proof that they are exactly the leaves in it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    /// Sorted by key digest.
    pub leaves: Vec<LeafNode>,

    /// Last key digest the chunk covers. Smaller than the requested end if the responder
    /// truncated the range.
    pub last: Digest,

    /// Proof over `[start, last]`.
    pub proof: SubrangeProof,
}

impl Write for Chunk {
    fn write(&self, buf: &mut impl BufMut) {
        self.leaves.write(buf);
        self.last.write(buf);
        self.proof.write(buf);
    }
}

impl EncodeSize for Chunk {
    fn encode_size(&self) -> usize {
        self.leaves.encode_size() + self.last.encode_size() + self.proof.encode_size()
    }
}

impl Read for Chunk {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let leaves = Vec::<LeafNode>::read_cfg(
            buf,
            &(RangeCfg::from(..=limits.max_chunk_keys), limits.leaf_cfg()),
        )?;
        let last = Digest::read(buf)?;
        let proof = SubrangeProof::read(buf)?;
        Ok(Self {
            leaves,
            last,
            proof,
        })
    }
}

/// Sent by state sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Tree {
    /// Which blocks the sender can serve and how far it has committed.
    ///
    /// `lowest_persisted_seq_nr` exceeds `highest_committed_seq_nr` if the sender holds no blocks.
    StateSyncSummary {
        lowest_persisted_seq_nr: SeqNr,
        highest_committed_seq_nr: SeqNr,
    },

    /// Ask for the leaves with key digests in `[start, end]` of the state after `seq_nr`.
    TreeSyncChunkRequest {
        seq_nr: SeqNr,
        start: Digest,
        end: Digest,
    },

    /// Answer to the request with the same `seq_nr` and `start`, or `None` if the responder no
    /// longer holds that snapshot (a go-away).
    TreeSyncChunkResponse {
        seq_nr: SeqNr,
        start: Digest,
        chunk: Option<Chunk>,
    },
}

impl Tree {
    pub fn check_size(&self, limits: &Limits, _: usize) -> bool {
        match self {
            Tree::StateSyncSummary { .. } => true,
            Tree::TreeSyncChunkRequest { start, end, .. } => start <= end,
            Tree::TreeSyncChunkResponse { chunk, .. } => chunk.as_ref().is_none_or(|chunk| {
                chunk.leaves.len() <= limits.max_chunk_keys
                    && chunk
                        .leaves
                        .iter()
                        .map(|leaf| leaf.key().len() + leaf.value().len())
                        .sum::<usize>()
                        <= limits.max_chunk_bytes.max(
                            // A single leaf is always served, whatever its size
                            limits.plugin.max_key_length + limits.plugin.max_value_length,
                        )
            }),
        }
    }

    pub fn class(&self) -> Class {
        match self {
            Tree::StateSyncSummary { .. } => Class::Plain,
            Tree::TreeSyncChunkRequest { .. } => Class::Request,
            Tree::TreeSyncChunkResponse { .. } => Class::Response,
        }
    }
}

const STATE_SYNC_SUMMARY: u8 = 0;
const TREE_SYNC_CHUNK_REQUEST: u8 = 1;
const TREE_SYNC_CHUNK_RESPONSE: u8 = 2;

impl Write for Tree {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Tree::StateSyncSummary {
                lowest_persisted_seq_nr,
                highest_committed_seq_nr,
            } => {
                STATE_SYNC_SUMMARY.write(buf);
                lowest_persisted_seq_nr.write(buf);
                highest_committed_seq_nr.write(buf);
            }
            Tree::TreeSyncChunkRequest { seq_nr, start, end } => {
                TREE_SYNC_CHUNK_REQUEST.write(buf);
                seq_nr.write(buf);
                start.write(buf);
                end.write(buf);
            }
            Tree::TreeSyncChunkResponse {
                seq_nr,
                start,
                chunk,
            } => {
                TREE_SYNC_CHUNK_RESPONSE.write(buf);
                seq_nr.write(buf);
                start.write(buf);
                chunk.write(buf);
            }
        }
    }
}

impl EncodeSize for Tree {
    fn encode_size(&self) -> usize {
        1 + match self {
            Tree::StateSyncSummary {
                lowest_persisted_seq_nr,
                highest_committed_seq_nr,
            } => lowest_persisted_seq_nr.encode_size() + highest_committed_seq_nr.encode_size(),
            Tree::TreeSyncChunkRequest { seq_nr, start, end } => {
                seq_nr.encode_size() + start.encode_size() + end.encode_size()
            }
            Tree::TreeSyncChunkResponse {
                seq_nr,
                start,
                chunk,
            } => seq_nr.encode_size() + start.encode_size() + chunk.encode_size(),
        }
    }
}

impl Read for Tree {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            STATE_SYNC_SUMMARY => {
                let lowest_persisted_seq_nr = SeqNr::read(buf)?;
                let highest_committed_seq_nr = SeqNr::read(buf)?;
                Ok(Tree::StateSyncSummary {
                    lowest_persisted_seq_nr,
                    highest_committed_seq_nr,
                })
            }
            TREE_SYNC_CHUNK_REQUEST => {
                let seq_nr = SeqNr::read(buf)?;
                let start = Digest::read(buf)?;
                let end = Digest::read(buf)?;
                Ok(Tree::TreeSyncChunkRequest { seq_nr, start, end })
            }
            TREE_SYNC_CHUNK_RESPONSE => {
                let seq_nr = SeqNr::read(buf)?;
                let start = Digest::read(buf)?;
                let chunk = Option::<Chunk>::read_cfg(buf, limits)?;
                Ok(Tree::TreeSyncChunkResponse {
                    seq_nr,
                    start,
                    chunk,
                })
            }
            tag => Err(CodecError::InvalidEnum("wire::Tree", tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ocr_codec::{Decode, Encode};
    use ocr_cryptography::PrivateKey;
    use ocr_utils::ConfigDigest;

    fn limits() -> Limits {
        let oracles = (0..4).map(|i| PrivateKey::from_seed(i).public_key()).collect();
        let mut shared = SharedConfig::new(ConfigDigest([1u8; 32]), oracles, 1);
        shared.max_blocks_per_response = 2;
        shared.max_tree_sync_chunk_keys = 2;
        Limits::new(&shared)
    }

    #[test]
    fn test_go_away_decodes() {
        let message = Blocks::BlockSyncResponse {
            from: 7,
            blocks: None,
        };
        assert!(message.check_size(&limits(), 4));
        assert_eq!(Blocks::decode_cfg(message.encode(), &limits()).unwrap(), message);
        assert_eq!(message.class(), Class::Response);
    }

    #[test]
    fn test_inverted_ranges_rejected() {
        assert!(!Blocks::BlockSyncRequest { from: 5, to: 4 }.check_size(&limits(), 4));
        let request = Tree::TreeSyncChunkRequest {
            seq_nr: 100,
            start: Digest::MAX,
            end: Digest::ZERO,
        };
        assert!(!request.check_size(&limits(), 4));
        assert_eq!(request.class(), Class::Request);
    }

    #[test]
    fn test_chunk_bounded_by_key_count() {
        let leaf = LeafNode::new(Bytes::from_static(b"key"), Bytes::from_static(b"value"));
        let message = Tree::TreeSyncChunkResponse {
            seq_nr: 100,
            start: Digest::ZERO,
            chunk: Some(Chunk {
                leaves: vec![leaf; 3],
                last: Digest::MAX,
                proof: SubrangeProof::default(),
            }),
        };
        assert!(!message.check_size(&limits(), 4));
        assert!(Tree::decode_cfg(message.encode(), &limits()).is_err());
    }

    #[test]
    fn test_summary_is_plain() {
        let summary = Tree::StateSyncSummary {
            lowest_persisted_seq_nr: 500,
            highest_committed_seq_nr: 1000,
        };
        assert_eq!(summary.class(), Class::Plain);
        assert_eq!(Tree::decode_cfg(summary.encode(), &limits()).unwrap(), summary);
    }
}
