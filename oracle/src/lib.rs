//! Run one member of an oracle committee.
//!
//! # Overview
//!
//! An [Oracle] wires every component of a committee member into one supervised unit:
//!
//! - the pacemaker, outcome generation, report attestation and transmission from
//!   [ocr_consensus];
//! - block persistence, state sync and the reaper from [ocr_sync];
//! - blob exchange from [ocr_broadcast].
//!
//! On startup the oracle restores its durable state, retrying with bounded exponential backoff
//! if the store cannot be read. It then starts each component on its own task and its own
//! [channel]. Commits reported by outcome generation drive block persistence and blob reaping;
//! commits reached through replay or tree-sync reap blobs too.
//!
//! Canceling the token passed to [Oracle::start] tears every component down. If any component
//! stops on its own, the rest are torn down as well and the oracle returns an [Error].
//!
//! # Status
//!
//! `ocr-oracle` is **ALPHA** software and is not yet recommended for production use.

use thiserror::Error;

mod config;
pub use config::Config;
mod engine;
pub use engine::{Channels, Oracle};
mod reporter;
mod restore;
pub use restore::Restored;

/// Channels each component sends and receives on.
pub mod channel {
    use ocr_p2p::Channel;

    pub const PACEMAKER: Channel = 0;
    pub const OUTCOME: Channel = 1;
    pub const ATTESTATION: Channel = 2;
    pub const BLOCKS: Channel = 3;
    pub const TREE: Channel = 4;
    pub const BLOBS: Channel = 5;

    /// Every channel, in the order of [Channels](crate::Channels).
    pub const ALL: [Channel; 6] = [PACEMAKER, OUTCOME, ATTESTATION, BLOCKS, TREE, BLOBS];
}

/// Errors that can occur while running an oracle.
#[derive(Error, Debug)]
pub enum Error {
    #[error("consensus: {0}")]
    Consensus(#[from] ocr_consensus::Error),
    #[error("sync: {0}")]
    Sync(#[from] ocr_sync::Error),
    #[error("blobs: {0}")]
    Broadcast(#[from] ocr_broadcast::Error),
    #[error("restore failed after {attempts} attempts: {source}")]
    Restore {
        attempts: usize,
        source: Box<Error>,
    },
    #[error("{0} stopped unexpectedly")]
    Stopped(&'static str),
}
