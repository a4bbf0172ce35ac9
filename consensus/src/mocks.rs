//! Plugin and transmitter implementations for tests and demos.

use crate::{
    plugin::{ContractTransmitter, KeyValueState, Plugin, PluginError},
    state,
    types::{
        AttestedReport, AttestedStateTransitionBlock, AttributedObservation, CertifiedBlock,
        OutcomeContext, Phase, ReportWithInfo, StateTransitionBlock, StateTransitionInputs,
        WriteSet,
    },
    Error,
};
use bytes::Bytes;
use futures::channel::mpsc;
use ocr_cryptography::{hash, PrivateKey};
use ocr_storage::kv::Database;
use ocr_utils::{byzantine_quorum, ConfigDigest, OracleId, SeqNr};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Key holding the counter in the key-value state.
pub const COUNTER_KEY: &[u8] = b"counter";

fn decode_u64(raw: &[u8]) -> Result<u64, PluginError> {
    let raw: [u8; 8] = raw
        .try_into()
        .map_err(|_| PluginError::Failed("malformed counter".into()))?;
    Ok(u64::from_be_bytes(raw))
}

/// Counts committed rounds.
///
/// Every oracle observes its own id, a proposal needs byz-quorum-many observations, and each
/// state transition increments the counter and reports its new value.
#[derive(Clone)]
pub struct CounterPlugin {
    me: OracleId,
    quorum: usize,

    /// When set, the state transition writes a value derived from the local oracle id.
    nondeterministic: Arc<AtomicBool>,
}

impl CounterPlugin {
    pub fn new(me: OracleId, n: u32, f: u32) -> Self {
        Self {
            me,
            quorum: byzantine_quorum(n, f) as usize,
            nondeterministic: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every later state transition depend on which oracle runs it.
    pub fn set_nondeterministic(&self, enabled: bool) {
        self.nondeterministic.store(enabled, Ordering::Relaxed);
    }

    /// Value of the counter in `state`.
    pub fn read_counter(state: &KeyValueState) -> Result<u64, PluginError> {
        match state.read(COUNTER_KEY)? {
            Some(raw) => decode_u64(&raw),
            None => Ok(0),
        }
    }
}

impl Plugin for CounterPlugin {
    async fn query(
        &self,
        context: OutcomeContext,
        _: &KeyValueState,
    ) -> Result<Bytes, PluginError> {
        Ok(Bytes::copy_from_slice(&context.round.to_be_bytes()))
    }

    async fn observation(
        &self,
        _: OutcomeContext,
        _: &Bytes,
        _: &KeyValueState,
    ) -> Result<Bytes, PluginError> {
        Ok(Bytes::copy_from_slice(&self.me.to_be_bytes()))
    }

    async fn validate_observation(
        &self,
        _: OutcomeContext,
        _: &Bytes,
        observation: &AttributedObservation,
        _: &KeyValueState,
    ) -> Result<(), PluginError> {
        if observation.observation[..] != observation.observer.to_be_bytes()[..] {
            return Err(PluginError::Failed("observation does not name observer".into()));
        }
        Ok(())
    }

    async fn observation_quorum(
        &self,
        _: OutcomeContext,
        _: &Bytes,
        observations: &[AttributedObservation],
        _: &KeyValueState,
    ) -> Result<bool, PluginError> {
        Ok(observations.len() >= self.quorum)
    }

    async fn state_transition(
        &self,
        _: &StateTransitionInputs,
        state: &mut KeyValueState,
    ) -> Result<Bytes, PluginError> {
        let mut counter = Self::read_counter(state)? + 1;
        if self.nondeterministic.load(Ordering::Relaxed) {
            counter += 1000 * (self.me as u64 + 1);
        }
        let value = Bytes::copy_from_slice(&counter.to_be_bytes());
        state.write(Bytes::from_static(COUNTER_KEY), value.clone());
        Ok(value)
    }

    async fn reports(
        &self,
        _: SeqNr,
        reports_plus_precursor: &Bytes,
    ) -> Result<Vec<ReportWithInfo>, PluginError> {
        if reports_plus_precursor.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![ReportWithInfo {
            report: reports_plus_precursor.clone(),
            info: Bytes::from_static(b"counter"),
        }])
    }

    async fn should_accept_attested_report(
        &self,
        _: SeqNr,
        _: &ReportWithInfo,
    ) -> Result<bool, PluginError> {
        Ok(true)
    }

    async fn should_transmit_accepted_report(
        &self,
        _: SeqNr,
        _: &ReportWithInfo,
    ) -> Result<bool, PluginError> {
        Ok(true)
    }
}

/// Forwards every transmitted report to a channel.
#[derive(Clone)]
pub struct RecordingTransmitter {
    sender: mpsc::UnboundedSender<(ConfigDigest, AttestedReport)>,
}

impl RecordingTransmitter {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(ConfigDigest, AttestedReport)>) {
        let (sender, receiver) = mpsc::unbounded();
        (Self { sender }, receiver)
    }
}

impl ContractTransmitter for RecordingTransmitter {
    async fn transmit(
        &self,
        config_digest: ConfigDigest,
        report: AttestedReport,
    ) -> Result<(), PluginError> {
        self.sender
            .unbounded_send((config_digest, report))
            .map_err(|_| PluginError::Failed("recorder closed".into()))
    }
}

/// Build and apply `length` blocks on top of the committed state in `db`, each commit-certified
/// by every key in `signers`.
///
/// The block at `seq_nr` writes `write_set(seq_nr)`. Blocks are persisted and applied, so `db`
/// ends up looking like an oracle that committed all of them.
pub fn certified_chain(
    db: &Database,
    config_digest: &ConfigDigest,
    signers: &[PrivateKey],
    length: SeqNr,
    write_set: impl Fn(SeqNr) -> WriteSet,
) -> Result<Vec<AttestedStateTransitionBlock>, Error> {
    let mut blocks = Vec::with_capacity(length as usize);
    for _ in 0..length {
        let mut txn = db.serialized_transaction();
        let committed = state::read_committed(&txn)?;
        let seq_nr = committed.seq_nr + 1;
        let write_set = write_set(seq_nr);
        let (state_root, _) = state::compute_state_root(&txn, seq_nr, &write_set)?;
        let block = StateTransitionBlock {
            epoch: 1,
            seq_nr,
            prev_history_digest: committed.history_digest,
            inputs_digest: hash(&seq_nr.to_be_bytes()),
            write_set,
            state_root,
            reports_plus_precursor: Bytes::new(),
        };
        let digest = block.digest(config_digest);
        let signatures = signers
            .iter()
            .enumerate()
            .map(|(i, signer)| (i as OracleId, Phase::Commit.sign(signer, config_digest, &digest)))
            .collect();
        let attested = CertifiedBlock { block, signatures };
        state::write_block(&mut txn, &attested)?;
        state::apply_block(&mut txn, config_digest, &attested.block)?;
        txn.commit()?;
        blocks.push(attested);
    }
    Ok(blocks)
}
