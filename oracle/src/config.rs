use governor::Quota;
use ocr_consensus::{ContractTransmitter, Plugin, SharedConfig};
use ocr_cryptography::PrivateKey;
use ocr_p2p::Blocker;
use ocr_storage::kv::Database;
use ocr_utils::OracleId;
use prometheus_client::registry::Registry;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Configuration for the [Oracle](crate::Oracle).
pub struct Config<P: Plugin, T: ContractTransmitter, B: Blocker> {
    pub me: OracleId,
    pub signer: PrivateKey,
    pub shared: SharedConfig,
    pub plugin: P,
    pub transmitter: T,

    /// Blocks oracles caught misbehaving by any component.
    pub blocker: B,

    /// Store holding every component's durable state.
    pub db: Database,

    pub registry: Arc<Mutex<Registry>>,

    /// The maximum size of each component's mailbox backlog.
    pub mailbox_size: usize,

    /// Messages held per sender for epochs this oracle has not entered yet.
    pub max_buffered_per_sender: usize,

    /// Committed blocks, counting back from the highest, whose reports are still attested and
    /// transmitted.
    pub report_window: u64,

    /// Requests per peer for blocks, tree chunks and blob chunks.
    pub fetch_rate_limit: Quota,

    /// How long to wait for a fetched item before asking another peer.
    pub fetch_timeout: Duration,

    /// Requests in flight at once per tree-sync or blob fetch.
    pub max_outstanding: usize,

    /// Number of ranges the key digest space is split into for tree-sync.
    pub tree_sync_ranges: usize,

    /// Size of each blob chunk.
    pub blob_chunk_size: usize,

    /// Largest blob payload accepted.
    pub max_blob_size: usize,

    /// How often a submitter re-announces a blob until it is certified.
    pub blob_offer_resend: Duration,

    /// Time between two reaper passes.
    pub reap_interval: Duration,

    /// Stale tree nodes deleted per reaper transaction.
    pub reap_batch: usize,

    /// Attempts to restore durable state before giving up.
    pub restore_attempts: usize,

    /// Delay before the first restore retry. Doubles on every failure.
    pub restore_backoff: Duration,

    /// Longest delay between two restore attempts.
    pub restore_max_backoff: Duration,
}
