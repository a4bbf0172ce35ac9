//! Agree on an attested sequence of state transitions and deliver the reports they produce.
//!
//! # Overview
//!
//! A committee of `n` oracles, at most `f` of which are byzantine, runs four actors per oracle:
//!
//! - [pacemaker]: moves the committee to a new epoch (and leader) when progress stalls.
//! - [outcome]: within an epoch, the leader drives rounds. Each round collects signed
//!   observations, runs the [Plugin]'s deterministic state transition on every oracle, and
//!   certifies the resulting [types::StateTransitionBlock] in two phases (prepare, then commit).
//!   Committed blocks are persisted and applied to the key-value state behind [state].
//! - [attestation]: signs the reports of each committed block and gathers byz-quorum-many
//!   signatures per report.
//! - [transmission]: hands attested reports to a [ContractTransmitter], staggering oracles so
//!   that only a few transmit each report.
//!
//! # Safety
//!
//! A block is applied only once byz-quorum-many oracles have signed a commit for it, and an
//! oracle only signs a commit after byz-quorum-many prepares. A new leader must start from the
//! highest certificate held by byz-quorum-many oracles (carried in an
//! [types::EpochStartProof]), so a block that may have been committed by anyone is always
//! re-proposed unchanged. Re-proposed blocks are replayed against local state and the resulting
//! state root must match the certified one.
//!
//! # Status
//!
//! `ocr-consensus` is **ALPHA** software and is not yet recommended for production use.

use ocr_storage::{jmt, kv};
use ocr_utils::SeqNr;
use std::future::Future;
use thiserror::Error;

pub mod attestation;
mod config;
pub use config::SharedConfig;
#[cfg(any(test, feature = "mocks"))]
pub mod mocks;
pub mod outcome;
pub mod pacemaker;
pub mod plugin;
pub use plugin::{ContractTransmitter, KeyValueState, Plugin, PluginError};
pub mod state;
pub mod transmission;
pub mod types;
pub mod wire;

/// Errors that can occur when reading or applying protocol state.
#[derive(Error, Debug)]
pub enum Error {
    #[error("storage: {0}")]
    Storage(#[from] kv::Error),
    #[error("tree: {0}")]
    Tree(#[from] jmt::Error),
    #[error("codec: {0}")]
    Codec(#[from] ocr_codec::Error),
    #[error("out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: SeqNr, got: SeqNr },
    #[error("history mismatch at {0}")]
    HistoryMismatch(SeqNr),
    #[error("state root mismatch at {0}")]
    RootMismatch(SeqNr),
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("plugin: {0}")]
    Plugin(#[from] PluginError),
}

/// Learns about blocks as they are persisted and applied.
///
/// Block persistence and blob reaping hang off this interface.
pub trait Reporter: Clone + Send + Sync + 'static {
    /// An attested block at `seq_nr` was persisted but may not be applied yet.
    fn persisted(&mut self, seq_nr: SeqNr) -> impl Future<Output = ()> + Send;

    /// The committee committed `seq_nr`, but blocks before it are missing locally.
    fn behind(&mut self, seq_nr: SeqNr) -> impl Future<Output = ()> + Send;

    /// The key-value state now reflects every block up to `seq_nr`.
    fn committed(&mut self, seq_nr: SeqNr) -> impl Future<Output = ()> + Send;
}

impl Reporter for () {
    async fn persisted(&mut self, _: SeqNr) {}

    async fn behind(&mut self, _: SeqNr) {}

    async fn committed(&mut self, _: SeqNr) {}
}
