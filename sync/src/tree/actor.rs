use super::{
    decide,
    metrics::{Metrics, Status, StatusLabel},
    read_status, write_status, Config, Decision, Phase, Summary, TreeSyncStatus,
};
use crate::{
    blocks,
    wire::{self, Chunk, Limits},
    Error,
};
use futures::{channel::mpsc, StreamExt};
use ocr_codec::{Decode, Encode};
use ocr_consensus::{
    state::{self, Committed},
    types::{AttestedStateTransitionBlock, CertifiedPrepareOrCommit},
    Reporter, SharedConfig,
};
use ocr_cryptography::Digest;
use ocr_p2p::{
    utils::requester::{self, Requester, ID},
    Blocker, Receiver, Recipients, Sender,
};
use ocr_storage::{
    jmt::{self, JellyfishMerkleTree, TreeWriter},
    kv::{self, Database},
};
use ocr_utils::{earliest, sleep_until, OracleId, SeqNr};
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Gossips state-sync summaries, decides how to catch up, and runs tree-sync.
pub struct Actor<B: Blocker, R: Reporter> {
    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    me: OracleId,
    shared: SharedConfig,
    limits: Limits,
    fetch_timeout: Duration,
    ranges: usize,
    max_outstanding: usize,

    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    db: Database,
    blocker: B,
    blocks: blocks::Mailbox,
    reporter: R,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    /// Latest summary heard from each peer.
    summaries: BTreeMap<OracleId, Summary>,

    /// In-memory copy of the persisted status.
    status: TreeSyncStatus,

    /// Fetch of the attested block at the target, while [Phase::Waiting].
    fetch: Option<JoinHandle<()>>,
    fetched_sender: mpsc::UnboundedSender<(SeqNr, Option<AttestedStateTransitionBlock>)>,
    fetched_receiver: mpsc::UnboundedReceiver<(SeqNr, Option<AttestedStateTransitionBlock>)>,

    ////////////////////////////////////////
    // Requests
    ////////////////////////////////////////
    requester: Requester<OracleId>,

    /// Pending range each outstanding chunk request covers.
    requests: HashMap<ID, (Digest, Digest)>,

    /// When rate limits allow another request.
    retry_at: Option<Instant>,

    metrics: Metrics,
}

impl<B: Blocker, R: Reporter> Actor<B, R> {
    pub fn new(cfg: Config<B, R>) -> Self {
        let metrics = Metrics::init(&cfg.registry);
        let mut requester = Requester::new(requester::Config {
            me: Some(cfg.me),
            rate_limit: cfg.rate_limit,
            initial: cfg.fetch_timeout / 2,
            timeout: cfg.fetch_timeout,
            seed: cfg.me as u64,
            registry: cfg.registry.clone(),
            metrics_prefix: "chunk_requester",
        });
        let ids: Vec<OracleId> = (0..cfg.shared.n() as OracleId).collect();
        requester.reconcile(&ids);
        let (fetched_sender, fetched_receiver) = mpsc::unbounded();

        Self {
            me: cfg.me,
            limits: Limits::new(&cfg.shared),
            shared: cfg.shared,
            fetch_timeout: cfg.fetch_timeout,
            ranges: cfg.ranges,
            max_outstanding: cfg.max_outstanding,

            db: cfg.db,
            blocker: cfg.blocker,
            blocks: cfg.blocks,
            reporter: cfg.reporter,

            summaries: BTreeMap::new(),
            status: TreeSyncStatus::default(),
            fetch: None,
            fetched_sender,
            fetched_receiver,

            requester,
            requests: HashMap::new(),
            retry_at: None,

            metrics,
        }
    }

    /// Spawn state sync on the current runtime.
    pub fn start<S: Sender, Rx: Receiver>(
        self,
        network: (S, Rx),
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(network, cancel))
    }

    async fn run<S: Sender, Rx: Receiver>(
        mut self,
        (mut sender, mut receiver): (S, Rx),
        cancel: CancellationToken,
    ) {
        self.status = match read_status(&self.db.read_transaction()) {
            Ok(status) => status,
            Err(err) => {
                error!(?err, "failed to read tree-sync status");
                return;
            }
        };
        self.set_phase();
        match self.status.phase {
            Phase::Inactive => {}
            Phase::Waiting => {
                info!(target = self.status.target_seq_nr, "resuming wait for target block");
                self.fetch_target();
            }
            Phase::Active => {
                info!(
                    target = self.status.target_seq_nr,
                    pending = self.status.pending.len(),
                    "resuming tree-sync"
                );
            }
        }

        let mut next_summary = Instant::now() + self.shared.delta_state_sync_summary;
        loop {
            self.pump(&mut sender).await;

            let timeout = self.requester.next().map(|(_, deadline)| deadline);
            let deadline = earliest(timeout, self.retry_at);

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("shutdown");
                    if let Some(fetch) = self.fetch.take() {
                        fetch.abort();
                    }
                    return;
                },

                Some((seq_nr, block)) = self.fetched_receiver.next() => {
                    self.handle_target_block(seq_nr, block);
                },

                msg = receiver.recv() => {
                    let (peer, msg) = match msg {
                        Ok(r) => r,
                        Err(err) => {
                            error!(?err, "receiver failed");
                            return;
                        }
                    };
                    let msg = match wire::Tree::decode_cfg(msg, &self.limits) {
                        Ok(msg) if msg.check_size(&self.limits, self.shared.n()) => msg,
                        Ok(_) => {
                            debug!(peer, "oversized message");
                            continue;
                        }
                        Err(err) => {
                            warn!(?err, peer, "failed to decode message");
                            self.blocker.block(peer).await;
                            continue;
                        }
                    };
                    self.handle_network(&mut sender, peer, msg).await;
                },

                _ = sleep_until(Some(next_summary)) => {
                    next_summary = Instant::now() + self.shared.delta_state_sync_summary;
                    self.gossip(&mut sender).await;
                    self.evaluate().await;
                    if self.status.phase == Phase::Active && self.status.pending.is_empty() {
                        self.complete().await;
                    }
                },

                _ = sleep_until(deadline) => {
                    self.handle_deadline();
                },
            }
        }
    }

    fn set_phase(&self) {
        let phase = match self.status.phase {
            Phase::Inactive => 0,
            Phase::Waiting => 1,
            Phase::Active => 2,
        };
        self.metrics.phase.set(phase);
    }

    /// Persist `status` and adopt it.
    fn persist_status(&mut self, status: TreeSyncStatus) -> Result<(), Error> {
        let mut txn = self.db.unserialized_transaction();
        write_status(&mut txn, &status)?;
        txn.commit()?;
        self.status = status;
        self.set_phase();
        Ok(())
    }

    async fn send<S: Sender>(&self, sender: &mut S, recipients: Recipients, msg: wire::Tree) {
        let priority = msg.class().priority();
        if let Err(err) = sender.send(recipients, msg.encode().freeze(), priority).await {
            debug!(?err, "failed to send");
        }
    }

    ////////////////////////////////////////
    // Summaries
    ////////////////////////////////////////

    /// Local committed sequence number and the lowest block held.
    fn local_summary(&self) -> Result<Summary, Error> {
        let txn = self.db.read_transaction();
        let highest_committed = state::read_committed(&txn)?.seq_nr;
        let lowest_persisted = state::persisted_range(&txn)?
            .map_or(highest_committed + 1, |(lowest, _)| lowest);
        Ok(Summary {
            lowest_persisted,
            highest_committed,
        })
    }

    async fn gossip<S: Sender>(&mut self, sender: &mut S) {
        let summary = match self.local_summary() {
            Ok(summary) => summary,
            Err(err) => {
                error!(?err, "failed to read local summary");
                return;
            }
        };
        trace!(
            lowest = summary.lowest_persisted,
            highest = summary.highest_committed,
            "sending summary"
        );
        self.send(
            sender,
            Recipients::All,
            wire::Tree::StateSyncSummary {
                lowest_persisted_seq_nr: summary.lowest_persisted,
                highest_committed_seq_nr: summary.highest_committed,
            },
        )
        .await;
    }

    /// Decide whether to block-sync or tree-sync from the summaries heard so far.
    async fn evaluate(&mut self) {
        if self.status.phase == Phase::Active {
            return;
        }
        let committed = match state::read_committed(&self.db.read_transaction()) {
            Ok(committed) => committed.seq_nr,
            Err(err) => {
                error!(?err, "failed to read committed state");
                return;
            }
        };
        let summaries: Vec<Summary> = self.summaries.values().copied().collect();
        match decide(
            committed,
            &summaries,
            self.shared.f as usize,
            self.shared.snapshot_interval,
        ) {
            Decision::UpToDate => {}
            Decision::BlockSync { target } => {
                if self.status.phase == Phase::Inactive {
                    debug!(committed, target, "block-sync");
                    self.blocks.behind(target).await;
                }
            }
            Decision::TreeSync { target } => {
                if self.status.phase == Phase::Waiting && self.status.target_seq_nr >= target {
                    return;
                }
                info!(committed, target, "starting tree-sync");
                if let Err(err) = self.persist_status(TreeSyncStatus::waiting(target)) {
                    error!(?err, "failed to persist tree-sync status");
                    return;
                }
                self.fetch_target();
            }
        }
    }

    /// Ask block persistence for the attested block at the target.
    fn fetch_target(&mut self) {
        if let Some(fetch) = self.fetch.take() {
            fetch.abort();
        }
        let target = self.status.target_seq_nr;
        let mut blocks = self.blocks.clone();
        let fetched = self.fetched_sender.clone();
        self.fetch = Some(tokio::spawn(async move {
            let block = blocks.fetch(target).await;
            let _ = fetched.unbounded_send((target, block));
        }));
    }

    /// Clear the local state and start fetching the key space of `block`.
    fn handle_target_block(&mut self, seq_nr: SeqNr, block: Option<AttestedStateTransitionBlock>) {
        self.fetch = None;
        if self.status.phase != Phase::Waiting || self.status.target_seq_nr != seq_nr {
            trace!(seq_nr, "stale target block");
            return;
        }
        let Some(block) = block else {
            warn!(seq_nr, "block persistence stopped before the target block arrived");
            return;
        };
        let status = TreeSyncStatus::active(seq_nr, block.block.state_root, self.ranges);
        let activate = || -> Result<(), Error> {
            let mut txn = self.db.unserialized_transaction();
            jmt::wipe(&mut txn)?;
            state::wipe_values(&mut txn)?;
            state::prune_blocks(&mut txn, SeqNr::MAX)?;
            state::write_block(&mut txn, &block)?;
            write_status(&mut txn, &status)?;
            txn.commit()?;
            Ok(())
        };
        if let Err(err) = activate() {
            error!(?err, "failed to activate tree-sync");
            return;
        }
        info!(
            seq_nr,
            root = ?status.target_state_root,
            ranges = status.pending.len(),
            "fetching state"
        );
        self.status = status;
        self.set_phase();
    }

    ////////////////////////////////////////
    // Requesting
    ////////////////////////////////////////

    /// Request every pending range not already requested, up to `max_outstanding`.
    async fn pump<S: Sender>(&mut self, sender: &mut S) {
        if self.status.phase != Phase::Active {
            return;
        }
        if self.retry_at.is_some_and(|at| at > Instant::now()) {
            return;
        }
        self.retry_at = None;

        let target = self.status.target_seq_nr;
        let pending: Vec<(Digest, Digest)> = self
            .status
            .pending
            .iter()
            .filter(|range| !self.requests.values().any(|requested| requested == *range))
            .copied()
            .collect();
        for (start, end) in pending {
            if self.requests.len() >= self.max_outstanding {
                return;
            }
            let summaries = &self.summaries;
            let (peer, id) = match self.requester.request_filtered(false, |peer| {
                summaries
                    .get(peer)
                    .is_some_and(|summary| summary.highest_committed >= target)
            }) {
                Ok(assigned) => assigned,
                Err(requester::Error::RateLimited(wait)) => {
                    self.retry_at = Some(Instant::now() + wait);
                    return;
                }
                Err(requester::Error::NoEligibleParticipants) => return,
            };
            self.requests.insert(id, (start, end));
            trace!(peer, ?start, ?end, "requesting chunk");
            self.send(
                sender,
                Recipients::One(peer),
                wire::Tree::TreeSyncChunkRequest {
                    seq_nr: target,
                    start,
                    end,
                },
            )
            .await;
        }
    }

    fn handle_deadline(&mut self) {
        let now = Instant::now();
        while let Some((id, deadline)) = self.requester.next() {
            if deadline > now {
                break;
            }
            let Some(request) = self.requester.cancel(id) else {
                break;
            };
            self.requests.remove(&id);
            debug!(peer = request.participant, "chunk request timed out");
            self.metrics
                .chunks
                .get_or_create(&StatusLabel::new(Status::Timeout))
                .inc();
            self.requester.timeout(request);
        }
    }

    ////////////////////////////////////////
    // Network
    ////////////////////////////////////////

    async fn handle_network<S: Sender>(&mut self, sender: &mut S, peer: OracleId, msg: wire::Tree) {
        match msg {
            wire::Tree::StateSyncSummary {
                lowest_persisted_seq_nr,
                highest_committed_seq_nr,
            } => {
                if peer == self.me {
                    return;
                }
                trace!(peer, lowest_persisted_seq_nr, highest_committed_seq_nr, "summary");
                self.summaries.insert(
                    peer,
                    Summary {
                        lowest_persisted: lowest_persisted_seq_nr,
                        highest_committed: highest_committed_seq_nr,
                    },
                );
            }
            wire::Tree::TreeSyncChunkRequest { seq_nr, start, end } => {
                let chunk = match self.serve(seq_nr, &start, &end) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        error!(?err, seq_nr, "failed to read chunk");
                        None
                    }
                };
                let status = if chunk.is_some() {
                    Status::Success
                } else {
                    Status::GoAway
                };
                self.metrics.served.get_or_create(&StatusLabel::new(status)).inc();
                self.send(
                    sender,
                    Recipients::One(peer),
                    wire::Tree::TreeSyncChunkResponse {
                        seq_nr,
                        start,
                        chunk,
                    },
                )
                .await;
            }
            wire::Tree::TreeSyncChunkResponse {
                seq_nr,
                start,
                chunk,
            } => self.handle_chunk(peer, seq_nr, start, chunk).await,
        }
    }

    /// Read the leaves in `[start, end]` at `seq_nr` and prove them, or `None` if the snapshot is
    /// gone.
    fn serve(&self, seq_nr: SeqNr, start: &Digest, end: &Digest) -> Result<Option<Chunk>, Error> {
        // A tree being synced is incomplete
        if self.status.phase != Phase::Inactive {
            return Ok(None);
        }
        let txn = self.db.read_transaction();
        let tree = JellyfishMerkleTree::new(&txn);
        if tree.get_root_hash_option(seq_nr)?.is_none() {
            return Ok(None);
        }
        let range = tree.get_range(
            seq_nr,
            start,
            end,
            self.limits.max_chunk_keys,
            self.limits.max_chunk_bytes,
        )?;
        let proof = tree.prove_subrange(seq_nr, start, &range.last)?;
        Ok(Some(Chunk {
            leaves: range.leaves,
            last: range.last,
            proof,
        }))
    }

    async fn handle_chunk(
        &mut self,
        peer: OracleId,
        seq_nr: SeqNr,
        start: Digest,
        chunk: Option<Chunk>,
    ) {
        if self.status.phase != Phase::Active || seq_nr != self.status.target_seq_nr {
            trace!(peer, seq_nr, "unsolicited chunk");
            return;
        }
        let Some((id, (_, end))) = self
            .requests
            .iter()
            .find(|(_, (requested, _))| *requested == start)
            .map(|(id, range)| (*id, *range))
        else {
            trace!(peer, ?start, "unsolicited chunk");
            return;
        };
        let Some(request) = self.requester.handle(&peer, id) else {
            trace!(peer, ?start, "chunk from unexpected peer");
            return;
        };
        self.requests.remove(&id);

        let Some(chunk) = chunk else {
            debug!(peer, seq_nr, "peer went away");
            self.metrics
                .chunks
                .get_or_create(&StatusLabel::new(Status::GoAway))
                .inc();
            self.requester.fail(request);
            self.requester.exclude(peer, self.fetch_timeout);
            return;
        };

        // A chunk cut short ends at its last leaf
        let ends_at_leaf = chunk
            .leaves
            .last()
            .is_some_and(|leaf| *leaf.key_digest() == chunk.last);
        let verified = if chunk.last < start || chunk.last > end {
            Err(jmt::Error::InvalidProof("chunk outside range"))
        } else if chunk.last != end && !ends_at_leaf {
            Err(jmt::Error::InvalidProof("truncated chunk does not end at a leaf"))
        } else {
            jmt::verify_subrange(
                &self.status.target_state_root,
                &start,
                &chunk.last,
                &chunk.leaves,
                &chunk.proof,
            )
        };
        if let Err(err) = verified {
            warn!(?err, peer, "invalid chunk");
            self.metrics
                .chunks
                .get_or_create(&StatusLabel::new(Status::Invalid))
                .inc();
            self.requester.fail(request);
            self.requester.block(peer);
            self.blocker.block(peer).await;
            return;
        }
        self.requester.resolve(request);
        self.metrics
            .chunks
            .get_or_create(&StatusLabel::new(Status::Success))
            .inc();

        let leaves = chunk.leaves.len();
        if let Err(err) = self.write_chunk(&start, chunk) {
            error!(?err, "failed to write chunk");
            return;
        }
        self.metrics.leaves.inc_by(leaves as u64);
        trace!(
            peer,
            ?start,
            leaves,
            pending = self.status.pending.len(),
            "wrote chunk"
        );
        if self.status.pending.is_empty() {
            self.complete().await;
        }
    }

    /// Insert the leaves of a verified chunk at the target version and record the progress.
    fn write_chunk(&mut self, start: &Digest, chunk: Chunk) -> Result<(), Error> {
        let target = self.status.target_seq_nr;
        let mut status = self.status.clone();
        if !status.advance(start, &chunk.last) {
            return Ok(());
        }

        let mut txn = self.db.unserialized_transaction();
        if !chunk.leaves.is_empty() {
            let updates: Vec<_> = chunk
                .leaves
                .iter()
                .map(|leaf| (leaf.key().clone(), Some(leaf.value().clone())))
                .collect();
            let batch = {
                let tree = JellyfishMerkleTree::new(&txn);
                let base = tree.get_root_hash_option(target)?.map(|_| target);
                tree.put_value_set(updates, base, target)?.1
            };
            txn.write_node_batch(&batch)?;
            for leaf in chunk.leaves {
                let (key, value) = leaf.into_parts();
                state::write_value(&mut txn, &key, Some(value))?;
            }
        }
        write_status(&mut txn, &status)?;
        txn.commit()?;
        self.status = status;
        Ok(())
    }

    /// Adopt the synced tree as the committed state.
    async fn complete(&mut self) {
        let target = self.status.target_seq_nr;
        match self.finish() {
            Ok(()) => {}
            Err(Error::Storage(kv::Error::Conflict { .. })) => {
                debug!(target, "completion raced with another commit, retrying");
                return;
            }
            Err(Error::RootMismatch(seq_nr)) => {
                error!(seq_nr, "synced tree does not match the attested root, restarting");
                if let Err(err) = self.persist_status(TreeSyncStatus::waiting(target)) {
                    error!(?err, "failed to persist tree-sync status");
                    return;
                }
                self.fetch_target();
                return;
            }
            Err(err) => {
                error!(?err, "failed to complete tree-sync");
                return;
            }
        }
        self.status = TreeSyncStatus::default();
        self.set_phase();
        self.metrics.synced.inc();
        info!(target, "tree-sync complete");
        self.blocks.resume().await;
        self.reporter.committed(target).await;
    }

    /// Set the committed and persisted sequence numbers to the target in one transaction.
    fn finish(&self) -> Result<(), Error> {
        let target = self.status.target_seq_nr;
        let mut txn = self.db.serialized_transaction();

        // A target with no keys has no leaves to write, only an empty root
        let (root, batch) = {
            let tree = JellyfishMerkleTree::new(&txn);
            match tree.get_root_hash_option(target)? {
                Some(root) => (root, None),
                None => {
                    let (root, batch) = tree.put_value_set(Vec::new(), None, target)?;
                    (root, Some(batch))
                }
            }
        };
        if root != self.status.target_state_root {
            return Err(Error::RootMismatch(target));
        }
        if let Some(batch) = batch {
            txn.write_node_batch(&batch)?;
        }

        let Some(block) = state::read_block(&txn, target, &self.shared.limits)? else {
            return Err(Error::MissingBlock(target));
        };
        state::write_committed(
            &mut txn,
            &Committed {
                seq_nr: target,
                history_digest: block.block.digest(&self.shared.config_digest),
            },
        )?;
        let highest = state::read_highest_certified(&txn, &self.shared.limits)?;
        if highest.seq_nr() < target {
            state::write_highest_certified(&mut txn, &CertifiedPrepareOrCommit::Commit(block))?;
        }
        write_status(&mut txn, &TreeSyncStatus::default())?;
        txn.commit()?;
        Ok(())
    }
}
