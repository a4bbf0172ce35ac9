use governor::Quota;
use ocr_cryptography::{PrivateKey, PublicKey};
use ocr_p2p::Blocker;
use ocr_storage::kv::Database;
use ocr_utils::{ConfigDigest, OracleId};
use prometheus_client::registry::Registry;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Default size of a blob chunk (4 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Configuration for the [`Engine`](super::Engine).
pub struct Config<B: Blocker> {
    /// Index of this oracle in `participants`.
    pub me: OracleId,

    /// Key used to sign availability attestations.
    pub signer: PrivateKey,

    /// Public keys of the committee, indexed by [OracleId].
    pub participants: Vec<PublicKey>,

    /// Maximum number of faulty oracles.
    pub f: u32,

    pub config_digest: ConfigDigest,

    /// Excludes oracles that serve corrupt chunks.
    pub blocker: B,

    /// Database holding blob metadata and chunks.
    pub db: Database,

    /// Size of each chunk (the last chunk may be shorter).
    pub chunk_size: usize,

    /// Largest payload accepted.
    pub max_blob_size: usize,

    /// How often a submitter re-announces a blob until it is certified.
    pub offer_resend: Duration,

    /// How long to wait for a chunk before asking another holder.
    pub fetch_timeout: Duration,

    /// Chunk requests per peer.
    pub rate_limit: Quota,

    /// Maximum number of chunks requested concurrently per blob.
    pub max_outstanding: usize,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    pub registry: Arc<Mutex<Registry>>,
}

impl<B: Blocker> Config<B> {
    pub(super) fn max_chunks(&self) -> usize {
        self.max_blob_size.div_ceil(self.chunk_size)
    }
}
