use crate::types::{CertifiedBlock, HistoryDigest, Phase, StateTransitionBlock};
use ocr_cryptography::{PublicKey, Signature};
use ocr_utils::{ConfigDigest, OracleId, SeqNr};
use std::collections::BTreeMap;
use tracing::debug;

/// Progress of a follower through a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum FollowerPhase {
    NewEpoch,
    NewRound,
    BackgroundObservation,
    SentObservation,
    BackgroundStateTransition,
    SentPrepare,
    SentCommit,
}

/// Progress of a leader through a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaderPhase {
    NewEpoch,
    SentEpochStart,
    SentRoundStart,
    Grace,
    SentProposal,
}

/// Prepare and commit signatures for the block at `seq_nr` in the current epoch.
///
/// Signatures may arrive before the block is known locally, so they are held unverified until
/// [Certification::set_block] is called.
pub struct Certification {
    pub seq_nr: SeqNr,
    block: Option<(StateTransitionBlock, HistoryDigest)>,

    unverified: BTreeMap<(OracleId, Phase), Signature>,
    prepares: BTreeMap<OracleId, Signature>,
    commits: BTreeMap<OracleId, Signature>,

    pub sent_commit: bool,
    pub done: bool,
}

impl Certification {
    pub fn new(seq_nr: SeqNr) -> Self {
        Self {
            seq_nr,
            block: None,
            unverified: BTreeMap::new(),
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            sent_commit: false,
            done: false,
        }
    }

    pub fn block(&self) -> Option<&(StateTransitionBlock, HistoryDigest)> {
        self.block.as_ref()
    }

    pub fn set_block(&mut self, block: StateTransitionBlock, digest: HistoryDigest) {
        self.block = Some((block, digest));
    }

    /// Record a signature, ignoring repeats from the same signer.
    pub fn add(&mut self, signer: OracleId, phase: Phase, signature: Signature) {
        let verified = match phase {
            Phase::Prepare => &self.prepares,
            Phase::Commit => &self.commits,
        };
        if verified.contains_key(&signer) {
            return;
        }
        self.unverified.entry((signer, phase)).or_insert(signature);
    }

    /// Verify held signatures against the block, dropping those that do not match it. Returns
    /// the signers of dropped signatures.
    ///
    /// An oracle that was proposed another block by an equivocating leader signs that block, so
    /// a mismatch alone does not show its signer is faulty.
    pub fn verify(
        &mut self,
        config_digest: &ConfigDigest,
        oracles: &[PublicKey],
    ) -> Vec<OracleId> {
        let Some((_, digest)) = self.block.as_ref() else {
            return Vec::new();
        };
        let mut mismatched = Vec::new();
        for ((signer, phase), signature) in std::mem::take(&mut self.unverified) {
            let Some(public_key) = oracles.get(signer as usize) else {
                continue;
            };
            if !phase.verify(public_key, config_digest, digest, &signature) {
                debug!(signer, ?phase, seq_nr = self.seq_nr, "signature does not match block");
                mismatched.push(signer);
                continue;
            }
            match phase {
                Phase::Prepare => self.prepares.insert(signer, signature),
                Phase::Commit => self.commits.insert(signer, signature),
            };
        }
        mismatched
    }

    /// The block with every verified signature of `phase`, once there are at least `quorum`.
    pub fn certificate(&self, phase: Phase, quorum: usize) -> Option<CertifiedBlock> {
        let (block, _) = self.block.as_ref()?;
        let signatures = match phase {
            Phase::Prepare => &self.prepares,
            Phase::Commit => &self.commits,
        };
        if signatures.len() < quorum {
            return None;
        }
        Some(CertifiedBlock {
            block: block.clone(),
            signatures: signatures.iter().map(|(s, sig)| (*s, *sig)).collect(),
        })
    }
}

/// Consecutive re-proposals whose replay disagreed with their certificate.
pub struct ReplayMismatches {
    consecutive: u32,
    limit: u32,
}

impl ReplayMismatches {
    pub fn new(limit: u32) -> Self {
        Self {
            consecutive: 0,
            limit,
        }
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn matched(&mut self) {
        self.consecutive = 0;
    }

    /// Record a mismatch. Returns true once the limit is reached.
    pub fn mismatched(&mut self) -> bool {
        self.consecutive = self.consecutive.saturating_add(1);
        self.consecutive >= self.limit
    }
}
