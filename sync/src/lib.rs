//! Bring an oracle's state up to date with the committee.
//!
//! # Overview
//!
//! An oracle that crashed, restarted, or joined late catches up in one of two ways:
//!
//! - [blocks]: persists attested blocks gap-free, replays them strictly in order into the
//!   key-value state, and fetches missing blocks from peers (block-sync). Used when peers still
//!   hold every block after the local committed sequence number.
//! - [tree]: when peers have pruned the blocks the oracle needs, downloads the whole key-value
//!   state at a snapshot from peers, chunk by chunk, verifying each chunk against the state root
//!   of an attested block (tree-sync).
//!
//! Oracles gossip a [wire::Tree::StateSyncSummary] so that each can tell which of the two
//! applies. The [reaper] deletes tree nodes and blocks that neither snapshot serving nor replay
//! still needs.
//!
//! # Status
//!
//! `ocr-sync` is **ALPHA** software and is not yet recommended for production use.

use ocr_storage::{jmt, kv};
use ocr_utils::SeqNr;
use thiserror::Error;

pub mod blocks;
pub mod reaper;
pub mod tree;
pub mod wire;

/// Errors that can occur while syncing.
#[derive(Error, Debug)]
pub enum Error {
    #[error("consensus: {0}")]
    Consensus(#[from] ocr_consensus::Error),
    #[error("storage: {0}")]
    Storage(#[from] kv::Error),
    #[error("tree: {0}")]
    Tree(#[from] jmt::Error),
    #[error("codec: {0}")]
    Codec(#[from] ocr_codec::Error),
    #[error("synced state root mismatch at {0}")]
    RootMismatch(SeqNr),
    #[error("missing block {0}")]
    MissingBlock(SeqNr),
}
