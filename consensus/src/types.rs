//! Blocks, certificates, and reports agreed on by the committee.

use crate::plugin::Limits;
use bytes::{Buf, BufMut, Bytes};
use ocr_codec::{Encode, EncodeSize, Error as CodecError, FixedSize, RangeCfg, Read, ReadExt, Write};
use ocr_cryptography::{hash, Digest, PrivateKey, PublicKey, Sha256, Signature};
use ocr_utils::{ConfigDigest, Epoch, OracleId, Round, SeqNr};
use std::collections::{BTreeMap, BTreeSet};

/// Upper bound on committee size accepted when decoding.
pub const MAX_ORACLES: usize = 256;

/// Chains every committed block to its predecessor.
pub type HistoryDigest = Digest;

/// Root of the Jellyfish Merkle Tree over the key-value state after a block.
pub type StateRootDigest = Digest;

const OBSERVATION_NAMESPACE: &[u8] = b"_OCR_OBSERVATION";
const INPUTS_NAMESPACE: &[u8] = b"_OCR_INPUTS";
const WRITE_SET_NAMESPACE: &[u8] = b"_OCR_WRITE_SET";
const BLOCK_NAMESPACE: &[u8] = b"_OCR_BLOCK";
const PREPARE_NAMESPACE: &[u8] = b"_OCR_PREPARE";
const COMMIT_NAMESPACE: &[u8] = b"_OCR_COMMIT";
const EPOCH_START_NAMESPACE: &[u8] = b"_OCR_EPOCH_START_REQUEST";
const REPORT_NAMESPACE: &[u8] = b"_OCR_REPORT";

fn signers_cfg() -> (RangeCfg, ((), ())) {
    (RangeCfg::from(..=MAX_ORACLES), ((), ()))
}

/// Check that `signatures` come from distinct committee members, verify each with `verify`, and
/// require at least `quorum` of them.
fn verify_quorum(
    signatures: &[(OracleId, Signature)],
    oracles: &[PublicKey],
    quorum: usize,
    verify: impl Fn(&PublicKey, &Signature) -> bool,
) -> bool {
    let mut seen = BTreeSet::new();
    for (signer, signature) in signatures {
        let Some(public_key) = oracles.get(*signer as usize) else {
            return false;
        };
        if !seen.insert(*signer) || !verify(public_key, signature) {
            return false;
        }
    }
    seen.len() >= quorum
}

/// Identifies a round within the sequence of state transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OutcomeContext {
    pub seq_nr: SeqNr,
    pub epoch: Epoch,
    pub round: Round,
}

impl OutcomeContext {
    fn payload(&self, config_digest: &ConfigDigest) -> Vec<u8> {
        let mut payload = Vec::with_capacity(56);
        payload.extend_from_slice(config_digest.as_bytes());
        payload.extend_from_slice(&self.seq_nr.to_be_bytes());
        payload.extend_from_slice(&self.epoch.to_be_bytes());
        payload.extend_from_slice(&self.round.to_be_bytes());
        payload
    }
}

/// An observation signed by the oracle that made it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttributedObservation {
    pub observer: OracleId,
    pub observation: Bytes,
    pub signature: Signature,
}

fn observation_payload(
    config_digest: &ConfigDigest,
    context: &OutcomeContext,
    query: &[u8],
    observation: &[u8],
) -> Vec<u8> {
    let mut payload = context.payload(config_digest);
    payload.extend_from_slice(&hash(query));
    payload.extend_from_slice(&hash(observation));
    payload
}

impl AttributedObservation {
    pub fn sign(
        signer: &PrivateKey,
        observer: OracleId,
        config_digest: &ConfigDigest,
        context: &OutcomeContext,
        query: &[u8],
        observation: Bytes,
    ) -> Self {
        let payload = observation_payload(config_digest, context, query, &observation);
        Self {
            observer,
            signature: signer.sign(OBSERVATION_NAMESPACE, &payload),
            observation,
        }
    }

    pub fn verify(
        &self,
        public_key: &PublicKey,
        config_digest: &ConfigDigest,
        context: &OutcomeContext,
        query: &[u8],
    ) -> bool {
        let payload = observation_payload(config_digest, context, query, &self.observation);
        public_key.verify(OBSERVATION_NAMESPACE, &payload, &self.signature)
    }
}

impl Write for AttributedObservation {
    fn write(&self, buf: &mut impl BufMut) {
        self.observer.write(buf);
        self.observation.write(buf);
        self.signature.write(buf);
    }
}

impl EncodeSize for AttributedObservation {
    fn encode_size(&self) -> usize {
        self.observer.encode_size() + self.observation.encode_size() + Signature::SIZE
    }
}

impl Read for AttributedObservation {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let observer = OracleId::read(buf)?;
        let observation =
            Bytes::read_cfg(buf, &RangeCfg::from(..=limits.max_observation_length))?;
        let signature = Signature::read(buf)?;
        Ok(Self {
            observer,
            observation,
            signature,
        })
    }
}

/// Everything the state transition of a round depends on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateTransitionInputs {
    pub seq_nr: SeqNr,
    pub epoch: Epoch,
    pub round: Round,
    pub query: Bytes,

    /// Sorted by observer.
    pub attributed_observations: Vec<AttributedObservation>,
}

impl StateTransitionInputs {
    pub fn context(&self) -> OutcomeContext {
        OutcomeContext {
            seq_nr: self.seq_nr,
            epoch: self.epoch,
            round: self.round,
        }
    }

    pub fn digest(&self, config_digest: &ConfigDigest) -> Digest {
        let mut hasher = Sha256::new();
        hasher
            .update(INPUTS_NAMESPACE)
            .update(config_digest.as_bytes())
            .update(&self.encode());
        hasher.finalize()
    }
}

impl Write for StateTransitionInputs {
    fn write(&self, buf: &mut impl BufMut) {
        self.seq_nr.write(buf);
        self.epoch.write(buf);
        self.round.write(buf);
        self.query.write(buf);
        self.attributed_observations.write(buf);
    }
}

impl EncodeSize for StateTransitionInputs {
    fn encode_size(&self) -> usize {
        self.seq_nr.encode_size()
            + self.epoch.encode_size()
            + self.round.encode_size()
            + self.query.encode_size()
            + self.attributed_observations.encode_size()
    }
}

impl Read for StateTransitionInputs {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let seq_nr = SeqNr::read(buf)?;
        let epoch = Epoch::read(buf)?;
        let round = Round::read(buf)?;
        let query = Bytes::read_cfg(buf, &RangeCfg::from(..=limits.max_query_length))?;
        let attributed_observations =
            Vec::read_cfg(buf, &(RangeCfg::from(..=MAX_ORACLES), *limits))?;
        Ok(Self {
            seq_nr,
            epoch,
            round,
            query,
            attributed_observations,
        })
    }
}

/// Key-value modifications produced by a state transition, sorted by key.
///
/// A `None` value deletes the key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteSet(Vec<(Bytes, Option<Bytes>)>);

impl WriteSet {
    pub fn new(modifications: BTreeMap<Bytes, Option<Bytes>>) -> Self {
        Self(modifications.into_iter().collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(Bytes, Option<Bytes>)> {
        self.0.iter()
    }

    pub fn into_inner(self) -> Vec<(Bytes, Option<Bytes>)> {
        self.0
    }

    pub fn digest(&self) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(WRITE_SET_NAMESPACE).update(&self.encode());
        hasher.finalize()
    }

    /// Whether every modification fits within `limits`.
    pub fn check_size(&self, limits: &Limits) -> bool {
        self.0.len() <= limits.max_key_value_modifications
            && self.0.iter().all(|(key, value)| {
                key.len() <= limits.max_key_length
                    && value
                        .as_ref()
                        .is_none_or(|value| value.len() <= limits.max_value_length)
            })
    }
}

impl Write for WriteSet {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl EncodeSize for WriteSet {
    fn encode_size(&self) -> usize {
        self.0.encode_size()
    }
}

impl Read for WriteSet {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let cfg = (
            RangeCfg::from(..=limits.max_key_value_modifications),
            (
                RangeCfg::from(..=limits.max_key_length),
                RangeCfg::from(..=limits.max_value_length),
            ),
        );
        let modifications = Vec::<(Bytes, Option<Bytes>)>::read_cfg(buf, &cfg)?;
        if modifications.windows(2).any(|pair| pair[0].0 >= pair[1].0) {
            return Err(CodecError::Invalid("WriteSet", "keys not sorted"));
        }
        Ok(Self(modifications))
    }
}

/// The agreed outcome of one round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateTransitionBlock {
    pub epoch: Epoch,
    pub seq_nr: SeqNr,
    pub prev_history_digest: HistoryDigest,
    pub inputs_digest: Digest,
    pub write_set: WriteSet,
    pub state_root: StateRootDigest,
    pub reports_plus_precursor: Bytes,
}

impl StateTransitionBlock {
    /// History digest of the chain ending in this block.
    pub fn digest(&self, config_digest: &ConfigDigest) -> HistoryDigest {
        let mut hasher = Sha256::new();
        hasher
            .update(BLOCK_NAMESPACE)
            .update(config_digest.as_bytes())
            .update(&self.epoch.to_be_bytes())
            .update(&self.seq_nr.to_be_bytes())
            .update(&self.prev_history_digest)
            .update(&self.inputs_digest)
            .update(&self.write_set.digest())
            .update(&self.state_root)
            .update(&hash(&self.reports_plus_precursor));
        hasher.finalize()
    }
}

impl Write for StateTransitionBlock {
    fn write(&self, buf: &mut impl BufMut) {
        self.epoch.write(buf);
        self.seq_nr.write(buf);
        self.prev_history_digest.write(buf);
        self.inputs_digest.write(buf);
        self.write_set.write(buf);
        self.state_root.write(buf);
        self.reports_plus_precursor.write(buf);
    }
}

impl EncodeSize for StateTransitionBlock {
    fn encode_size(&self) -> usize {
        self.epoch.encode_size()
            + self.seq_nr.encode_size()
            + Digest::SIZE * 3
            + self.write_set.encode_size()
            + self.reports_plus_precursor.encode_size()
    }
}

impl Read for StateTransitionBlock {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let epoch = Epoch::read(buf)?;
        let seq_nr = SeqNr::read(buf)?;
        let prev_history_digest = Digest::read(buf)?;
        let inputs_digest = Digest::read(buf)?;
        let write_set = WriteSet::read_cfg(buf, limits)?;
        let state_root = Digest::read(buf)?;
        let reports_plus_precursor = Bytes::read_cfg(
            buf,
            &RangeCfg::from(..=limits.max_reports_plus_precursor_length),
        )?;
        Ok(Self {
            epoch,
            seq_nr,
            prev_history_digest,
            inputs_digest,
            write_set,
            state_root,
            reports_plus_precursor,
        })
    }
}

/// The two signing phases of a round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Prepare,
    Commit,
}

impl Phase {
    fn namespace(&self) -> &'static [u8] {
        match self {
            Phase::Prepare => PREPARE_NAMESPACE,
            Phase::Commit => COMMIT_NAMESPACE,
        }
    }

    fn payload(config_digest: &ConfigDigest, digest: &HistoryDigest) -> Vec<u8> {
        let mut payload = Vec::with_capacity(64);
        payload.extend_from_slice(config_digest.as_bytes());
        payload.extend_from_slice(digest);
        payload
    }

    pub fn sign(
        &self,
        signer: &PrivateKey,
        config_digest: &ConfigDigest,
        digest: &HistoryDigest,
    ) -> Signature {
        signer.sign(self.namespace(), &Self::payload(config_digest, digest))
    }

    pub fn verify(
        &self,
        public_key: &PublicKey,
        config_digest: &ConfigDigest,
        digest: &HistoryDigest,
        signature: &Signature,
    ) -> bool {
        public_key.verify(
            self.namespace(),
            &Self::payload(config_digest, digest),
            signature,
        )
    }
}

/// A block together with byz-quorum-many signatures of one [Phase].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertifiedBlock {
    pub block: StateTransitionBlock,

    /// Sorted by signer.
    pub signatures: Vec<(OracleId, Signature)>,
}

/// A block with a commit certificate: final and safe to apply.
pub type AttestedStateTransitionBlock = CertifiedBlock;

impl CertifiedBlock {
    pub fn verify(
        &self,
        phase: Phase,
        config_digest: &ConfigDigest,
        oracles: &[PublicKey],
        quorum: usize,
    ) -> bool {
        let digest = self.block.digest(config_digest);
        verify_quorum(&self.signatures, oracles, quorum, |public_key, signature| {
            phase.verify(public_key, config_digest, &digest, signature)
        })
    }
}

impl Write for CertifiedBlock {
    fn write(&self, buf: &mut impl BufMut) {
        self.block.write(buf);
        self.signatures.write(buf);
    }
}

impl EncodeSize for CertifiedBlock {
    fn encode_size(&self) -> usize {
        self.block.encode_size() + self.signatures.encode_size()
    }
}

impl Read for CertifiedBlock {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let block = StateTransitionBlock::read_cfg(buf, limits)?;
        let signatures = Vec::read_cfg(buf, &signers_cfg())?;
        Ok(Self { block, signatures })
    }
}

/// Position of a certificate in the order used to pick the highest one.
///
/// Ordered by sequence number, then commit over prepare, then epoch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CertifiedTimestamp {
    pub seq_nr: SeqNr,
    pub committed: bool,
    pub epoch: Epoch,
}

impl Write for CertifiedTimestamp {
    fn write(&self, buf: &mut impl BufMut) {
        self.seq_nr.write(buf);
        self.committed.write(buf);
        self.epoch.write(buf);
    }
}

impl Read for CertifiedTimestamp {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let seq_nr = SeqNr::read(buf)?;
        let committed = bool::read(buf)?;
        let epoch = Epoch::read(buf)?;
        Ok(Self {
            seq_nr,
            committed,
            epoch,
        })
    }
}

impl FixedSize for CertifiedTimestamp {
    const SIZE: usize = u64::SIZE + bool::SIZE + u64::SIZE;
}

/// The highest certificate an oracle has seen.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum CertifiedPrepareOrCommit {
    /// Nothing has been prepared or committed yet.
    #[default]
    Genesis,
    Prepare(CertifiedBlock),
    Commit(CertifiedBlock),
}

impl CertifiedPrepareOrCommit {
    pub fn timestamp(&self) -> CertifiedTimestamp {
        match self {
            CertifiedPrepareOrCommit::Genesis => CertifiedTimestamp {
                seq_nr: 0,
                committed: true,
                epoch: 0,
            },
            CertifiedPrepareOrCommit::Prepare(certified) => CertifiedTimestamp {
                seq_nr: certified.block.seq_nr,
                committed: false,
                epoch: certified.block.epoch,
            },
            CertifiedPrepareOrCommit::Commit(certified) => CertifiedTimestamp {
                seq_nr: certified.block.seq_nr,
                committed: true,
                epoch: certified.block.epoch,
            },
        }
    }

    pub fn seq_nr(&self) -> SeqNr {
        self.timestamp().seq_nr
    }

    pub fn verify(
        &self,
        config_digest: &ConfigDigest,
        oracles: &[PublicKey],
        quorum: usize,
    ) -> bool {
        match self {
            CertifiedPrepareOrCommit::Genesis => true,
            CertifiedPrepareOrCommit::Prepare(certified) => {
                certified.verify(Phase::Prepare, config_digest, oracles, quorum)
            }
            CertifiedPrepareOrCommit::Commit(certified) => {
                certified.verify(Phase::Commit, config_digest, oracles, quorum)
            }
        }
    }
}

impl Write for CertifiedPrepareOrCommit {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            CertifiedPrepareOrCommit::Genesis => 0u8.write(buf),
            CertifiedPrepareOrCommit::Prepare(certified) => {
                1u8.write(buf);
                certified.write(buf);
            }
            CertifiedPrepareOrCommit::Commit(certified) => {
                2u8.write(buf);
                certified.write(buf);
            }
        }
    }
}

impl EncodeSize for CertifiedPrepareOrCommit {
    fn encode_size(&self) -> usize {
        1 + match self {
            CertifiedPrepareOrCommit::Genesis => 0,
            CertifiedPrepareOrCommit::Prepare(certified)
            | CertifiedPrepareOrCommit::Commit(certified) => certified.encode_size(),
        }
    }
}

impl Read for CertifiedPrepareOrCommit {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            0 => Ok(CertifiedPrepareOrCommit::Genesis),
            1 => Ok(CertifiedPrepareOrCommit::Prepare(CertifiedBlock::read_cfg(
                buf, limits,
            )?)),
            2 => Ok(CertifiedPrepareOrCommit::Commit(CertifiedBlock::read_cfg(
                buf, limits,
            )?)),
            tag => Err(CodecError::InvalidEnum("CertifiedPrepareOrCommit", tag)),
        }
    }
}

fn epoch_start_payload(
    config_digest: &ConfigDigest,
    epoch: Epoch,
    timestamp: &CertifiedTimestamp,
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(config_digest.as_bytes());
    payload.extend_from_slice(&epoch.to_be_bytes());
    payload.extend_from_slice(&timestamp.encode());
    payload
}

/// Sign the timestamp of the highest certificate held when asked to start `epoch`.
pub fn sign_epoch_start(
    signer: &PrivateKey,
    config_digest: &ConfigDigest,
    epoch: Epoch,
    timestamp: &CertifiedTimestamp,
) -> Signature {
    signer.sign(
        EPOCH_START_NAMESPACE,
        &epoch_start_payload(config_digest, epoch, timestamp),
    )
}

pub fn verify_epoch_start(
    public_key: &PublicKey,
    config_digest: &ConfigDigest,
    epoch: Epoch,
    timestamp: &CertifiedTimestamp,
    signature: &Signature,
) -> bool {
    public_key.verify(
        EPOCH_START_NAMESPACE,
        &epoch_start_payload(config_digest, epoch, timestamp),
        signature,
    )
}

/// A signed claim by `signer` about the highest certificate it held at the start of an epoch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignedHighestCertifiedTimestamp {
    pub signer: OracleId,
    pub timestamp: CertifiedTimestamp,
    pub signature: Signature,
}

impl Write for SignedHighestCertifiedTimestamp {
    fn write(&self, buf: &mut impl BufMut) {
        self.signer.write(buf);
        self.timestamp.write(buf);
        self.signature.write(buf);
    }
}

impl Read for SignedHighestCertifiedTimestamp {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let signer = OracleId::read(buf)?;
        let timestamp = CertifiedTimestamp::read(buf)?;
        let signature = Signature::read(buf)?;
        Ok(Self {
            signer,
            timestamp,
            signature,
        })
    }
}

impl FixedSize for SignedHighestCertifiedTimestamp {
    const SIZE: usize = OracleId::SIZE + CertifiedTimestamp::SIZE + Signature::SIZE;
}

/// Proof that the certificate an epoch starts from is the highest among byz-quorum-many oracles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EpochStartProof {
    pub highest_certified: CertifiedPrepareOrCommit,
    pub highest_certified_proof: Vec<SignedHighestCertifiedTimestamp>,
}

impl EpochStartProof {
    pub fn verify(
        &self,
        config_digest: &ConfigDigest,
        epoch: Epoch,
        oracles: &[PublicKey],
        quorum: usize,
    ) -> bool {
        let mut seen = BTreeSet::new();
        let mut max = None;
        for claim in self.highest_certified_proof.iter() {
            let Some(public_key) = oracles.get(claim.signer as usize) else {
                return false;
            };
            if !seen.insert(claim.signer) {
                return false;
            }
            if !verify_epoch_start(
                public_key,
                config_digest,
                epoch,
                &claim.timestamp,
                &claim.signature,
            ) {
                return false;
            }
            max = max.max(Some(claim.timestamp));
        }
        seen.len() >= quorum
            && max == Some(self.highest_certified.timestamp())
            && self.highest_certified.verify(config_digest, oracles, quorum)
    }
}

impl Write for EpochStartProof {
    fn write(&self, buf: &mut impl BufMut) {
        self.highest_certified.write(buf);
        self.highest_certified_proof.write(buf);
    }
}

impl EncodeSize for EpochStartProof {
    fn encode_size(&self) -> usize {
        self.highest_certified.encode_size() + self.highest_certified_proof.encode_size()
    }
}

impl Read for EpochStartProof {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let highest_certified = CertifiedPrepareOrCommit::read_cfg(buf, limits)?;
        let highest_certified_proof = Vec::read_cfg(buf, &(RangeCfg::from(..=MAX_ORACLES), ()))?;
        Ok(Self {
            highest_certified,
            highest_certified_proof,
        })
    }
}

/// A report produced from a committed block, with opaque information for the transmitter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportWithInfo {
    pub report: Bytes,
    pub info: Bytes,
}

impl ReportWithInfo {
    fn payload(&self, config_digest: &ConfigDigest, seq_nr: SeqNr, index: u32) -> Vec<u8> {
        let mut payload = Vec::with_capacity(108);
        payload.extend_from_slice(config_digest.as_bytes());
        payload.extend_from_slice(&seq_nr.to_be_bytes());
        payload.extend_from_slice(&index.to_be_bytes());
        payload.extend_from_slice(&hash(&self.report));
        payload.extend_from_slice(&hash(&self.info));
        payload
    }

    pub fn sign(
        &self,
        signer: &PrivateKey,
        config_digest: &ConfigDigest,
        seq_nr: SeqNr,
        index: u32,
    ) -> Signature {
        signer.sign(REPORT_NAMESPACE, &self.payload(config_digest, seq_nr, index))
    }

    pub fn verify(
        &self,
        public_key: &PublicKey,
        config_digest: &ConfigDigest,
        seq_nr: SeqNr,
        index: u32,
        signature: &Signature,
    ) -> bool {
        public_key.verify(
            REPORT_NAMESPACE,
            &self.payload(config_digest, seq_nr, index),
            signature,
        )
    }
}

impl Write for ReportWithInfo {
    fn write(&self, buf: &mut impl BufMut) {
        self.report.write(buf);
        self.info.write(buf);
    }
}

impl EncodeSize for ReportWithInfo {
    fn encode_size(&self) -> usize {
        self.report.encode_size() + self.info.encode_size()
    }
}

impl Read for ReportWithInfo {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let range = RangeCfg::from(..=limits.max_report_length);
        let report = Bytes::read_cfg(buf, &range)?;
        let info = Bytes::read_cfg(buf, &range)?;
        Ok(Self { report, info })
    }
}

/// A report with byz-quorum-many signatures, ready to be transmitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AttestedReport {
    pub seq_nr: SeqNr,
    pub index: u32,
    pub report: ReportWithInfo,

    /// Sorted by signer.
    pub signatures: Vec<(OracleId, Signature)>,
}

impl AttestedReport {
    pub fn verify(
        &self,
        config_digest: &ConfigDigest,
        oracles: &[PublicKey],
        quorum: usize,
    ) -> bool {
        verify_quorum(&self.signatures, oracles, quorum, |public_key, signature| {
            self.report
                .verify(public_key, config_digest, self.seq_nr, self.index, signature)
        })
    }
}

impl Write for AttestedReport {
    fn write(&self, buf: &mut impl BufMut) {
        self.seq_nr.write(buf);
        self.index.write(buf);
        self.report.write(buf);
        self.signatures.write(buf);
    }
}

impl EncodeSize for AttestedReport {
    fn encode_size(&self) -> usize {
        self.seq_nr.encode_size()
            + self.index.encode_size()
            + self.report.encode_size()
            + self.signatures.encode_size()
    }
}

impl Read for AttestedReport {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        let seq_nr = SeqNr::read(buf)?;
        let index = u32::read(buf)?;
        let report = ReportWithInfo::read_cfg(buf, limits)?;
        let signatures = Vec::read_cfg(buf, &signers_cfg())?;
        Ok(Self {
            seq_nr,
            index,
            report,
            signatures,
        })
    }
}
