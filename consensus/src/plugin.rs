//! The application plugged into the protocol and the contract it reports to.

use crate::{
    state,
    types::{
        AttestedReport, AttributedObservation, OutcomeContext, ReportWithInfo,
        StateTransitionInputs, WriteSet,
    },
};
use bytes::Bytes;
use ocr_storage::kv::{self, Database, Transaction};
use ocr_utils::{ConfigDigest, SeqNr};
use std::{collections::BTreeMap, future::Future, time::Duration};
use thiserror::Error;

/// Errors returned by a [Plugin] or [ContractTransmitter].
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("timed out")]
    Timeout,
    #[error("state: {0}")]
    State(#[from] kv::Error),
    #[error("{0}")]
    Failed(String),
}

/// Size limits the plugin promises to respect (and that peers enforce).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Limits {
    pub max_query_length: usize,
    pub max_observation_length: usize,
    pub max_reports_plus_precursor_length: usize,
    pub max_report_length: usize,
    pub max_report_count: usize,
    pub max_key_value_modifications: usize,
    pub max_key_length: usize,
    pub max_value_length: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_query_length: 1024,
            max_observation_length: 1024,
            max_reports_plus_precursor_length: 4096,
            max_report_length: 1024,
            max_report_count: 16,
            max_key_value_modifications: 1024,
            max_key_length: 256,
            max_value_length: 4096,
        }
    }
}

/// Upper bounds on how long each plugin call may take.
#[derive(Clone, Copy, Debug)]
pub struct Timeouts {
    pub query: Duration,
    pub observation: Duration,
    pub validate_observation: Duration,
    pub observation_quorum: Duration,
    pub state_transition: Duration,
    pub reports: Duration,
    pub should_accept_attested_report: Duration,
    pub should_transmit_accepted_report: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        let second = Duration::from_secs(1);
        Self {
            query: second,
            observation: second,
            validate_observation: second,
            observation_quorum: second,
            state_transition: second,
            reports: second,
            should_accept_attested_report: second,
            should_transmit_accepted_report: second,
        }
    }
}

/// Run `future` for at most `duration`.
pub async fn bounded<T>(
    duration: Duration,
    future: impl Future<Output = Result<T, PluginError>>,
) -> Result<T, PluginError> {
    tokio::time::timeout(duration, future)
        .await
        .unwrap_or(Err(PluginError::Timeout))
}

/// The committed key-value state as seen by the plugin, with a private overlay of writes.
///
/// Writes are never applied directly: [KeyValueState::into_write_set] hands them back to the
/// protocol, which commits them only once the block is certified.
pub struct KeyValueState {
    txn: Transaction,
    writes: BTreeMap<Bytes, Option<Bytes>>,
}

impl KeyValueState {
    pub fn new(db: &Database) -> Self {
        Self {
            txn: db.read_transaction(),
            writes: BTreeMap::new(),
        }
    }

    pub fn read(&self, key: &[u8]) -> Result<Option<Bytes>, PluginError> {
        if let Some(value) = self.writes.get(key) {
            return Ok(value.clone());
        }
        Ok(state::read_value(&self.txn, key)?)
    }

    pub fn write(&mut self, key: Bytes, value: Bytes) {
        self.writes.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Bytes) {
        self.writes.insert(key, None);
    }

    pub fn into_write_set(self) -> WriteSet {
        WriteSet::new(self.writes)
    }
}

/// Application logic run by every oracle.
///
/// Every method must be deterministic given its inputs and the state, except [Plugin::query] and
/// [Plugin::observation] (which read the outside world). Calls are bounded by [Timeouts] and a
/// failed call only affects the current round.
pub trait Plugin: Clone + Send + Sync + 'static {
    /// Called by the leader to start a round.
    fn query(
        &self,
        context: OutcomeContext,
        state: &KeyValueState,
    ) -> impl Future<Output = Result<Bytes, PluginError>> + Send;

    /// Called by every oracle in response to the leader's query.
    fn observation(
        &self,
        context: OutcomeContext,
        query: &Bytes,
        state: &KeyValueState,
    ) -> impl Future<Output = Result<Bytes, PluginError>> + Send;

    fn validate_observation(
        &self,
        context: OutcomeContext,
        query: &Bytes,
        observation: &AttributedObservation,
        state: &KeyValueState,
    ) -> impl Future<Output = Result<(), PluginError>> + Send;

    /// Whether `observations` (each already validated) are enough to propose.
    fn observation_quorum(
        &self,
        context: OutcomeContext,
        query: &Bytes,
        observations: &[AttributedObservation],
        state: &KeyValueState,
    ) -> impl Future<Output = Result<bool, PluginError>> + Send;

    /// Write the effects of `inputs` to `state` and return the reports-plus-precursor.
    fn state_transition(
        &self,
        inputs: &StateTransitionInputs,
        state: &mut KeyValueState,
    ) -> impl Future<Output = Result<Bytes, PluginError>> + Send;

    /// Expand a committed reports-plus-precursor into individual reports.
    fn reports(
        &self,
        seq_nr: SeqNr,
        reports_plus_precursor: &Bytes,
    ) -> impl Future<Output = Result<Vec<ReportWithInfo>, PluginError>> + Send;

    fn should_accept_attested_report(
        &self,
        seq_nr: SeqNr,
        report: &ReportWithInfo,
    ) -> impl Future<Output = Result<bool, PluginError>> + Send;

    /// Asked again right before transmitting, after the report's transmission delay.
    fn should_transmit_accepted_report(
        &self,
        seq_nr: SeqNr,
        report: &ReportWithInfo,
    ) -> impl Future<Output = Result<bool, PluginError>> + Send;
}

/// Delivers attested reports to their destination.
pub trait ContractTransmitter: Clone + Send + Sync + 'static {
    fn transmit(
        &self,
        config_digest: ConfigDigest,
        report: AttestedReport,
    ) -> impl Future<Output = Result<(), PluginError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_bounded_timeout() {
        let result: Result<(), _> = bounded(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(PluginError::Timeout)));
    }

    #[test]
    fn test_overlay_reads_own_writes() {
        let db = Database::new();
        let mut txn = db.unserialized_transaction();
        state::write_value(&mut txn, b"a", Some(Bytes::from_static(b"1"))).unwrap();
        txn.commit().unwrap();

        let mut kv = KeyValueState::new(&db);
        assert_eq!(kv.read(b"a").unwrap(), Some(Bytes::from_static(b"1")));
        kv.delete(Bytes::from_static(b"a"));
        kv.write(Bytes::from_static(b"b"), Bytes::from_static(b"2"));
        assert_eq!(kv.read(b"a").unwrap(), None);

        let write_set = kv.into_write_set();
        let keys: Vec<_> = write_set.iter().map(|(key, _)| key.clone()).collect();
        assert_eq!(keys, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

        // The database is untouched
        let txn = db.read_transaction();
        assert_eq!(
            state::read_value(&txn, b"a").unwrap(),
            Some(Bytes::from_static(b"1"))
        );
    }
}
