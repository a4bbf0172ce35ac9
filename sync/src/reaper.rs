//! Delete tree nodes and blocks older than the snapshots peers may still sync from.
//!
//! The two latest snapshots (multiples of `snapshot_interval` at or below the committed sequence
//! number) are kept whole, along with every version and block after the older of them. Nodes only
//! reachable from earlier versions and blocks before it are deleted in batches. Nothing is reaped
//! while tree-sync runs, as the local tree is then incomplete.

use crate::{
    tree::{read_status, Phase},
    Error,
};
use ocr_consensus::state;
use ocr_storage::{jmt, kv::Database};
use ocr_utils::SeqNr;
use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for the [Reaper].
pub struct Config {
    pub db: Database,

    /// Blocks between two retained snapshots.
    pub snapshot_interval: u64,

    /// Time between two passes.
    pub interval: Duration,

    /// Time before retrying a pass that failed.
    pub retry: Duration,

    /// Stale nodes deleted per transaction.
    pub batch: usize,

    pub registry: Arc<Mutex<Registry>>,
}

struct Metrics {
    nodes: Counter,
    blocks: Counter,
    retained: Gauge,
}

impl Metrics {
    fn init(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            nodes: Counter::default(),
            blocks: Counter::default(),
            retained: Gauge::default(),
        };
        let mut registry = registry.lock().unwrap();
        let registry = registry.sub_registry_with_prefix("reaper");
        registry.register("nodes", "Stale tree nodes deleted", metrics.nodes.clone());
        registry.register("blocks", "Blocks pruned", metrics.blocks.clone());
        registry.register(
            "retained",
            "Oldest version kept whole",
            metrics.retained.clone(),
        );
        metrics
    }
}

/// Periodically reaps stale tree nodes and old blocks.
pub struct Reaper {
    db: Database,
    snapshot_interval: u64,
    interval: Duration,
    retry: Duration,
    batch: usize,
    metrics: Metrics,
}

impl Reaper {
    pub fn new(cfg: Config) -> Self {
        Self {
            metrics: Metrics::init(&cfg.registry),
            db: cfg.db,
            snapshot_interval: cfg.snapshot_interval.max(1),
            interval: cfg.interval,
            retry: cfg.retry,
            batch: cfg.batch.max(1),
        }
    }

    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(self, cancel: CancellationToken) {
        let mut next = Instant::now() + self.interval;
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("shutdown");
                    return;
                },

                _ = tokio::time::sleep_until(next) => {
                    next = match self.reap() {
                        Ok(_) => Instant::now() + self.interval,
                        Err(err) => {
                            warn!(?err, "failed to reap, retrying");
                            Instant::now() + self.retry
                        }
                    };
                },
            }
        }
    }

    /// Oldest version to keep whole given the committed sequence number.
    fn retained(&self, committed: SeqNr) -> Option<SeqNr> {
        let latest = committed / self.snapshot_interval * self.snapshot_interval;
        latest
            .checked_sub(self.snapshot_interval)
            .filter(|retained| *retained > 0)
    }

    /// Run one pass. Returns the version kept whole, if anything was eligible.
    pub fn reap(&self) -> Result<Option<SeqNr>, Error> {
        if read_status(&self.db.read_transaction())?.phase != Phase::Inactive {
            debug!("tree-sync in progress, skipping");
            return Ok(None);
        }
        let committed = state::read_committed(&self.db.read_transaction())?.seq_nr;
        let Some(retained) = self.retained(committed) else {
            return Ok(None);
        };

        let mut nodes = 0;
        loop {
            let mut txn = self.db.unserialized_transaction();
            let purged = jmt::purge_stale_nodes(&mut txn, retained, self.batch)?;
            txn.commit()?;
            nodes += purged;
            if purged < self.batch {
                break;
            }
        }
        let mut txn = self.db.unserialized_transaction();
        let blocks = state::prune_blocks(&mut txn, retained)?;
        txn.commit()?;

        self.metrics.nodes.inc_by(nodes as u64);
        self.metrics.blocks.inc_by(blocks as u64);
        self.metrics.retained.set(retained as i64);
        debug!(committed, retained, nodes, blocks, "reaped");
        Ok(Some(retained))
    }
}
