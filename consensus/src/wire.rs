//! Messages exchanged between oracles, one enum per actor channel.
//!
//! Decoding is bounded by [Limits] and [MAX_ORACLES]; [check_size](Outcome::check_size)
//! additionally bounds every list by the actual committee size.

use crate::{
    plugin::Limits,
    types::{
        AttestedStateTransitionBlock, AttributedObservation, CertifiedBlock,
        CertifiedPrepareOrCommit, EpochStartProof, MAX_ORACLES,
    },
};
use bytes::{Buf, BufMut, Bytes};
use ocr_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use ocr_cryptography::Signature;
use ocr_p2p::Class;
use ocr_utils::{Epoch, Round, SeqNr};

/// Sent by the pacemaker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pacemaker {
    /// The sender wants to move to `epoch` (or any later one).
    NewEpochWish { epoch: Epoch },
}

impl Pacemaker {
    pub fn check_size(&self, _: &Limits, _: usize) -> bool {
        true
    }

    pub fn class(&self) -> Class {
        Class::Plain
    }
}

impl Write for Pacemaker {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Pacemaker::NewEpochWish { epoch } => {
                0u8.write(buf);
                epoch.write(buf);
            }
        }
    }
}

impl EncodeSize for Pacemaker {
    fn encode_size(&self) -> usize {
        match self {
            Pacemaker::NewEpochWish { epoch } => 1 + epoch.encode_size(),
        }
    }
}

impl Read for Pacemaker {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(Pacemaker::NewEpochWish {
                epoch: Epoch::read(buf)?,
            }),
            tag => Err(CodecError::InvalidEnum("wire::Pacemaker", tag)),
        }
    }
}

/// Sent during outcome generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Follower to leader: the highest certificate the sender holds.
    EpochStartRequest {
        epoch: Epoch,
        highest_certified: CertifiedPrepareOrCommit,
        signature: Signature,
    },

    /// Leader to all: the certificate the epoch starts from.
    EpochStart { epoch: Epoch, proof: EpochStartProof },

    /// Leader to all: begin round `round` for `seq_nr`.
    RoundStart {
        epoch: Epoch,
        seq_nr: SeqNr,
        round: Round,
        query: Bytes,
    },

    /// Follower to leader.
    Observation {
        epoch: Epoch,
        seq_nr: SeqNr,
        round: Round,
        observation: AttributedObservation,
    },

    /// Leader to all: the inputs of the state transition.
    Proposal {
        epoch: Epoch,
        seq_nr: SeqNr,
        round: Round,
        query: Bytes,

        /// Sorted by observer.
        attributed_observations: Vec<AttributedObservation>,
    },

    /// Prepare signature over the block at `seq_nr`.
    Prepare {
        epoch: Epoch,
        seq_nr: SeqNr,
        signature: Signature,
    },

    /// Commit signature over the block at `seq_nr`.
    Commit {
        epoch: Epoch,
        seq_nr: SeqNr,
        signature: Signature,
    },

    /// Ask for the commit certificate of `seq_nr`.
    CertifiedCommitRequest { seq_nr: SeqNr },

    CertifiedCommit(AttestedStateTransitionBlock),
}

impl Outcome {
    /// Epoch the message belongs to, if it is bound to one.
    pub fn epoch(&self) -> Option<Epoch> {
        match self {
            Outcome::EpochStartRequest { epoch, .. }
            | Outcome::EpochStart { epoch, .. }
            | Outcome::RoundStart { epoch, .. }
            | Outcome::Observation { epoch, .. }
            | Outcome::Proposal { epoch, .. }
            | Outcome::Prepare { epoch, .. }
            | Outcome::Commit { epoch, .. } => Some(*epoch),
            Outcome::CertifiedCommitRequest { .. } | Outcome::CertifiedCommit(_) => None,
        }
    }

    pub fn check_size(&self, limits: &Limits, n: usize) -> bool {
        match self {
            Outcome::EpochStartRequest {
                highest_certified, ..
            } => certified_size_ok(highest_certified, limits, n),
            Outcome::EpochStart { proof, .. } => {
                proof.highest_certified_proof.len() <= n
                    && certified_size_ok(&proof.highest_certified, limits, n)
            }
            Outcome::RoundStart { query, .. } => query.len() <= limits.max_query_length,
            Outcome::Observation { observation, .. } => {
                observation.observation.len() <= limits.max_observation_length
            }
            Outcome::Proposal {
                query,
                attributed_observations,
                ..
            } => {
                query.len() <= limits.max_query_length
                    && attributed_observations.len() <= n
                    && attributed_observations
                        .iter()
                        .all(|o| o.observation.len() <= limits.max_observation_length)
            }
            Outcome::Prepare { .. }
            | Outcome::Commit { .. }
            | Outcome::CertifiedCommitRequest { .. } => true,
            Outcome::CertifiedCommit(certified) => block_size_ok(certified, limits, n),
        }
    }

    pub fn class(&self) -> Class {
        match self {
            Outcome::CertifiedCommitRequest { .. } => Class::Request,
            Outcome::CertifiedCommit(_) => Class::Response,
            _ => Class::Plain,
        }
    }
}

fn block_size_ok(certified: &CertifiedBlock, limits: &Limits, n: usize) -> bool {
    certified.signatures.len() <= n
        && certified.block.write_set.check_size(limits)
        && certified.block.reports_plus_precursor.len() <= limits.max_reports_plus_precursor_length
}

fn certified_size_ok(certified: &CertifiedPrepareOrCommit, limits: &Limits, n: usize) -> bool {
    match certified {
        CertifiedPrepareOrCommit::Genesis => true,
        CertifiedPrepareOrCommit::Prepare(certified)
        | CertifiedPrepareOrCommit::Commit(certified) => block_size_ok(certified, limits, n),
    }
}

const EPOCH_START_REQUEST: u8 = 0;
const EPOCH_START: u8 = 1;
const ROUND_START: u8 = 2;
const OBSERVATION: u8 = 3;
const PROPOSAL: u8 = 4;
const PREPARE: u8 = 5;
const COMMIT: u8 = 6;
const CERTIFIED_COMMIT_REQUEST: u8 = 7;
const CERTIFIED_COMMIT: u8 = 8;

impl Write for Outcome {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Outcome::EpochStartRequest {
                epoch,
                highest_certified,
                signature,
            } => {
                EPOCH_START_REQUEST.write(buf);
                epoch.write(buf);
                highest_certified.write(buf);
                signature.write(buf);
            }
            Outcome::EpochStart { epoch, proof } => {
                EPOCH_START.write(buf);
                epoch.write(buf);
                proof.write(buf);
            }
            Outcome::RoundStart {
                epoch,
                seq_nr,
                round,
                query,
            } => {
                ROUND_START.write(buf);
                epoch.write(buf);
                seq_nr.write(buf);
                round.write(buf);
                query.write(buf);
            }
            Outcome::Observation {
                epoch,
                seq_nr,
                round,
                observation,
            } => {
                OBSERVATION.write(buf);
                epoch.write(buf);
                seq_nr.write(buf);
                round.write(buf);
                observation.write(buf);
            }
            Outcome::Proposal {
                epoch,
                seq_nr,
                round,
                query,
                attributed_observations,
            } => {
                PROPOSAL.write(buf);
                epoch.write(buf);
                seq_nr.write(buf);
                round.write(buf);
                query.write(buf);
                attributed_observations.write(buf);
            }
            Outcome::Prepare {
                epoch,
                seq_nr,
                signature,
            } => {
                PREPARE.write(buf);
                epoch.write(buf);
                seq_nr.write(buf);
                signature.write(buf);
            }
            Outcome::Commit {
                epoch,
                seq_nr,
                signature,
            } => {
                COMMIT.write(buf);
                epoch.write(buf);
                seq_nr.write(buf);
                signature.write(buf);
            }
            Outcome::CertifiedCommitRequest { seq_nr } => {
                CERTIFIED_COMMIT_REQUEST.write(buf);
                seq_nr.write(buf);
            }
            Outcome::CertifiedCommit(certified) => {
                CERTIFIED_COMMIT.write(buf);
                certified.write(buf);
            }
        }
    }
}

impl EncodeSize for Outcome {
    fn encode_size(&self) -> usize {
        1 + match self {
            Outcome::EpochStartRequest {
                epoch,
                highest_certified,
                signature,
            } => epoch.encode_size() + highest_certified.encode_size() + signature.encode_size(),
            Outcome::EpochStart { epoch, proof } => epoch.encode_size() + proof.encode_size(),
            Outcome::RoundStart {
                epoch,
                seq_nr,
                round,
                query,
            } => {
                epoch.encode_size()
                    + seq_nr.encode_size()
                    + round.encode_size()
                    + query.encode_size()
            }
            Outcome::Observation {
                epoch,
                seq_nr,
                round,
                observation,
            } => {
                epoch.encode_size()
                    + seq_nr.encode_size()
                    + round.encode_size()
                    + observation.encode_size()
            }
            Outcome::Proposal {
                epoch,
                seq_nr,
                round,
                query,
                attributed_observations,
            } => {
                epoch.encode_size()
                    + seq_nr.encode_size()
                    + round.encode_size()
                    + query.encode_size()
                    + attributed_observations.encode_size()
            }
            Outcome::Prepare {
                epoch,
                seq_nr,
                signature,
            }
            | Outcome::Commit {
                epoch,
                seq_nr,
                signature,
            } => epoch.encode_size() + seq_nr.encode_size() + signature.encode_size(),
            Outcome::CertifiedCommitRequest { seq_nr } => seq_nr.encode_size(),
            Outcome::CertifiedCommit(certified) => certified.encode_size(),
        }
    }
}

impl Read for Outcome {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let query_cfg = RangeCfg::from(..=limits.max_query_length);
        let observations_cfg = (RangeCfg::from(..=MAX_ORACLES), *limits);
        match u8::read(buf)? {
            EPOCH_START_REQUEST => {
                let epoch = Epoch::read(buf)?;
                let highest_certified = CertifiedPrepareOrCommit::read_cfg(buf, limits)?;
                let signature = Signature::read(buf)?;
                Ok(Outcome::EpochStartRequest {
                    epoch,
                    highest_certified,
                    signature,
                })
            }
            EPOCH_START => {
                let epoch = Epoch::read(buf)?;
                let proof = EpochStartProof::read_cfg(buf, limits)?;
                Ok(Outcome::EpochStart { epoch, proof })
            }
            ROUND_START => {
                let epoch = Epoch::read(buf)?;
                let seq_nr = SeqNr::read(buf)?;
                let round = Round::read(buf)?;
                let query = Bytes::read_cfg(buf, &query_cfg)?;
                Ok(Outcome::RoundStart {
                    epoch,
                    seq_nr,
                    round,
                    query,
                })
            }
            OBSERVATION => {
                let epoch = Epoch::read(buf)?;
                let seq_nr = SeqNr::read(buf)?;
                let round = Round::read(buf)?;
                let observation = AttributedObservation::read_cfg(buf, limits)?;
                Ok(Outcome::Observation {
                    epoch,
                    seq_nr,
                    round,
                    observation,
                })
            }
            PROPOSAL => {
                let epoch = Epoch::read(buf)?;
                let seq_nr = SeqNr::read(buf)?;
                let round = Round::read(buf)?;
                let query = Bytes::read_cfg(buf, &query_cfg)?;
                let attributed_observations = Vec::read_cfg(buf, &observations_cfg)?;
                Ok(Outcome::Proposal {
                    epoch,
                    seq_nr,
                    round,
                    query,
                    attributed_observations,
                })
            }
            PREPARE => {
                let epoch = Epoch::read(buf)?;
                let seq_nr = SeqNr::read(buf)?;
                let signature = Signature::read(buf)?;
                Ok(Outcome::Prepare {
                    epoch,
                    seq_nr,
                    signature,
                })
            }
            COMMIT => {
                let epoch = Epoch::read(buf)?;
                let seq_nr = SeqNr::read(buf)?;
                let signature = Signature::read(buf)?;
                Ok(Outcome::Commit {
                    epoch,
                    seq_nr,
                    signature,
                })
            }
            CERTIFIED_COMMIT_REQUEST => Ok(Outcome::CertifiedCommitRequest {
                seq_nr: SeqNr::read(buf)?,
            }),
            CERTIFIED_COMMIT => Ok(Outcome::CertifiedCommit(CertifiedBlock::read_cfg(
                buf, limits,
            )?)),
            tag => Err(CodecError::InvalidEnum("wire::Outcome", tag)),
        }
    }
}

/// Sent during report attestation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Attestation {
    /// The sender's signature over each report of the block at `seq_nr`, in report order.
    ReportSignatures {
        seq_nr: SeqNr,
        signatures: Vec<Signature>,
    },
}

impl Attestation {
    pub fn check_size(&self, limits: &Limits, _: usize) -> bool {
        match self {
            Attestation::ReportSignatures { signatures, .. } => {
                signatures.len() <= limits.max_report_count
            }
        }
    }

    pub fn class(&self) -> Class {
        Class::Plain
    }
}

impl Write for Attestation {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Attestation::ReportSignatures { seq_nr, signatures } => {
                0u8.write(buf);
                seq_nr.write(buf);
                signatures.write(buf);
            }
        }
    }
}

impl EncodeSize for Attestation {
    fn encode_size(&self) -> usize {
        match self {
            Attestation::ReportSignatures { seq_nr, signatures } => {
                1 + seq_nr.encode_size() + signatures.encode_size()
            }
        }
    }
}

impl Read for Attestation {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => {
                let seq_nr = SeqNr::read(buf)?;
                let signatures =
                    Vec::read_cfg(buf, &(RangeCfg::from(..=limits.max_report_count), ()))?;
                Ok(Attestation::ReportSignatures { seq_nr, signatures })
            }
            tag => Err(CodecError::InvalidEnum("wire::Attestation", tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutcomeContext, StateTransitionBlock, WriteSet};
    use ocr_codec::{Decode, Encode};
    use ocr_cryptography::{Digest, PrivateKey};
    use ocr_utils::ConfigDigest;

    fn limits() -> Limits {
        Limits {
            max_query_length: 8,
            max_observation_length: 8,
            max_report_count: 2,
            ..Limits::default()
        }
    }

    #[test]
    fn test_oversized_query_rejected() {
        let message = Outcome::RoundStart {
            epoch: 1,
            seq_nr: 1,
            round: 1,
            query: Bytes::from(vec![0u8; 9]),
        };
        assert!(!message.check_size(&limits(), 4));
        assert!(Outcome::decode_cfg(message.encode(), &limits()).is_err());
    }

    #[test]
    fn test_proposal_bounded_by_committee() {
        let signer = PrivateKey::from_seed(0);
        let context = OutcomeContext {
            seq_nr: 1,
            epoch: 1,
            round: 1,
        };
        let observation = AttributedObservation::sign(
            &signer,
            0,
            &ConfigDigest::default(),
            &context,
            b"q",
            Bytes::from_static(b"obs"),
        );
        let message = Outcome::Proposal {
            epoch: 1,
            seq_nr: 1,
            round: 1,
            query: Bytes::from_static(b"q"),
            attributed_observations: vec![observation; 5],
        };
        assert!(!message.check_size(&limits(), 4));
        assert!(message.check_size(&limits(), 5));
        let decoded = Outcome::decode_cfg(message.encode(), &limits()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_classes() {
        let block = CertifiedBlock {
            block: StateTransitionBlock {
                epoch: 1,
                seq_nr: 1,
                prev_history_digest: Digest::ZERO,
                inputs_digest: Digest::ZERO,
                write_set: WriteSet::default(),
                state_root: Digest::ZERO,
                reports_plus_precursor: Bytes::new(),
            },
            signatures: Vec::new(),
        };
        assert_eq!(Outcome::CertifiedCommitRequest { seq_nr: 1 }.class(), Class::Request);
        assert_eq!(Outcome::CertifiedCommit(block).class(), Class::Response);
        assert_eq!(Pacemaker::NewEpochWish { epoch: 2 }.class(), Class::Plain);
    }

    #[test]
    fn test_too_many_report_signatures() {
        let signature = PrivateKey::from_seed(1).sign(b"ns", b"msg");
        let message = Attestation::ReportSignatures {
            seq_nr: 3,
            signatures: vec![signature; 3],
        };
        assert!(!message.check_size(&limits(), 4));
        assert!(Attestation::decode_cfg(message.encode(), &limits()).is_err());
    }
}
