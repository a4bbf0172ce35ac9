use super::{
    ingress::{Mailbox, Message},
    metrics::{Metrics, Status, StatusLabel},
    replay, Config,
};
use crate::{
    tree::{read_status, Phase as TreePhase},
    wire::{self, Limits},
    Error,
};
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use ocr_codec::{Decode, Encode};
use ocr_consensus::{
    state,
    types::{AttestedStateTransitionBlock, Phase},
    Reporter, SharedConfig,
};
use ocr_p2p::{
    utils::requester::{self, Requester, ID},
    Blocker, Receiver, Recipients, Sender,
};
use ocr_storage::kv::Database;
use ocr_utils::{earliest, sleep_until, OracleId, SeqNr};
use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Why a block-sync request was sent.
#[derive(Clone, Copy, Debug)]
enum Purpose {
    /// Fill the gap after the persisted blocks with `[from, to]`.
    Fill { from: SeqNr, to: SeqNr },

    /// Fetch the single block at `seq_nr` for a waiter.
    Fetch { seq_nr: SeqNr },
}

/// Persists and replays blocks, and fetches the ones the oracle is missing.
pub struct Actor<B: Blocker, R: Reporter> {
    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    shared: SharedConfig,
    limits: Limits,
    fetch_timeout: Duration,

    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    db: Database,
    blocker: B,
    reporter: R,
    mailbox_receiver: mpsc::Receiver<Message>,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    /// Highest sequence number the committee is known to have committed.
    target: SeqNr,

    /// Highest block persisted without gaps after the committed state.
    persisted: SeqNr,

    /// Waiters for blocks fetched on behalf of tree-sync.
    fetches: BTreeMap<SeqNr, Vec<oneshot::Sender<AttestedStateTransitionBlock>>>,

    /// Set when a persisted block failed to replay. Replay stays off until the store is
    /// replaced by tree-sync.
    halted: bool,

    ////////////////////////////////////////
    // Requests
    ////////////////////////////////////////
    requester: Requester<OracleId>,
    requests: HashMap<ID, Purpose>,

    /// When rate limits allow another request.
    retry_at: Option<Instant>,

    metrics: Metrics,
}

impl<B: Blocker, R: Reporter> Actor<B, R> {
    pub fn new(cfg: Config<B, R>) -> (Self, Mailbox) {
        let (sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let metrics = Metrics::init(&cfg.registry);
        let mut requester = Requester::new(requester::Config {
            me: Some(cfg.me),
            rate_limit: cfg.rate_limit,
            initial: cfg.fetch_timeout / 2,
            timeout: cfg.fetch_timeout,
            seed: cfg.me as u64,
            registry: cfg.registry.clone(),
            metrics_prefix: "block_requester",
        });
        let ids: Vec<OracleId> = (0..cfg.shared.n() as OracleId).collect();
        requester.reconcile(&ids);

        (
            Self {
                limits: Limits::new(&cfg.shared),
                shared: cfg.shared,
                fetch_timeout: cfg.fetch_timeout,

                db: cfg.db,
                blocker: cfg.blocker,
                reporter: cfg.reporter,
                mailbox_receiver,

                target: 0,
                persisted: 0,
                fetches: BTreeMap::new(),
                halted: false,

                requester,
                requests: HashMap::new(),
                retry_at: None,

                metrics,
            },
            Mailbox::new(sender),
        )
    }

    /// Spawn block persistence on the current runtime.
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
        if let Err(err) = self.restore() {
            error!(?err, "failed to restore persisted blocks");
            return;
        }
        self.replay().await;

        loop {
            self.fetches.retain(|_, waiters| {
                waiters.retain(|waiter| !waiter.is_canceled());
                !waiters.is_empty()
            });
            self.pump(&mut sender).await;

            let timeout = self.requester.next().map(|(_, deadline)| deadline);
            let deadline = earliest(timeout, self.retry_at);

            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("shutdown");
                    return;
                },

                mail = self.mailbox_receiver.next() => {
                    let Some(mail) = mail else {
                        debug!("mailbox closed");
                        return;
                    };
                    self.handle_mail(mail).await;
                },

                msg = receiver.recv() => {
                    let (peer, msg) = match msg {
                        Ok(r) => r,
                        Err(err) => {
                            error!(?err, "receiver failed");
                            return;
                        }
                    };
                    let msg = match wire::Blocks::decode_cfg(msg, &self.limits) {
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

                _ = sleep_until(deadline) => {
                    self.handle_deadline();
                },
            }
        }
    }

    /// Find where the gap-free run of persisted blocks ends.
    fn restore(&mut self) -> Result<(), Error> {
        let txn = self.db.read_transaction();
        let committed = state::read_committed(&txn)?.seq_nr;
        let highest = state::persisted_range(&txn)?.map_or(0, |(_, highest)| highest);
        self.persisted = committed.max(highest);
        self.target = self.target.max(self.persisted);
        self.metrics.committed.set(committed as i64);
        Ok(())
    }

    fn tree_syncing(&self) -> bool {
        match read_status(&self.db.read_transaction()) {
            Ok(status) => status.phase == TreePhase::Active,
            Err(err) => {
                error!(?err, "failed to read tree-sync status");
                true
            }
        }
    }

    async fn send<S: Sender>(&self, sender: &mut S, recipients: Recipients, msg: wire::Blocks) {
        let priority = msg.class().priority();
        if let Err(err) = sender.send(recipients, msg.encode().freeze(), priority).await {
            debug!(?err, "failed to send");
        }
    }

    ////////////////////////////////////////
    // Replay
    ////////////////////////////////////////

    async fn replay(&mut self) {
        if self.halted || self.tree_syncing() {
            return;
        }
        let before = state::read_committed(&self.db.read_transaction()).map(|c| c.seq_nr);
        match replay(&self.db, &self.shared.config_digest, &self.shared.limits) {
            Ok(Some(seq_nr)) => {
                let replayed = before.map_or(0, |before| seq_nr.saturating_sub(before));
                self.metrics.replayed.inc_by(replayed);
                self.metrics.committed.set(seq_nr as i64);
                info!(seq_nr, replayed, "replayed blocks");
                self.reporter.committed(seq_nr).await;
            }
            Ok(None) => {}
            Err(Error::Consensus(
                err @ (ocr_consensus::Error::RootMismatch(_)
                | ocr_consensus::Error::HistoryMismatch(_)),
            )) => {
                error!(?err, "attested block does not replay, operator intervention required");
                self.halted = true;
            }
            Err(err) => {
                error!(?err, "failed to replay blocks");
            }
        }
    }

    ////////////////////////////////////////
    // Mailbox
    ////////////////////////////////////////

    async fn handle_mail(&mut self, mail: Message) {
        match mail {
            Message::Persisted { seq_nr } => {
                trace!(seq_nr, "mailbox: persisted");
                self.target = self.target.max(seq_nr);
                self.persisted = self.persisted.max(seq_nr);
                self.replay().await;
            }
            Message::Behind { seq_nr } => {
                trace!(seq_nr, "mailbox: behind");
                if seq_nr > self.target {
                    debug!(seq_nr, persisted = self.persisted, "behind the committee");
                    self.target = seq_nr;
                }
            }
            Message::Committed { seq_nr } => {
                trace!(seq_nr, "mailbox: committed");
                self.target = self.target.max(seq_nr);
                self.persisted = self.persisted.max(seq_nr);
                self.metrics.committed.set(seq_nr as i64);
            }
            Message::Fetch { seq_nr, responder } => {
                trace!(seq_nr, "mailbox: fetch");
                self.fetches.entry(seq_nr).or_default().push(responder);
            }
            Message::Resume => {
                trace!("mailbox: resume");
                self.halted = false;
                let fills: Vec<ID> = self
                    .requests
                    .iter()
                    .filter(|(_, purpose)| matches!(purpose, Purpose::Fill { .. }))
                    .map(|(id, _)| *id)
                    .collect();
                for id in fills {
                    self.requests.remove(&id);
                    self.requester.cancel(id);
                }
                self.persisted = 0;
                if let Err(err) = self.restore() {
                    error!(?err, "failed to restore persisted blocks");
                    return;
                }
                self.replay().await;
            }
        }
    }

    ////////////////////////////////////////
    // Requesting
    ////////////////////////////////////////

    /// Issue a request for the next missing range and for every unserved fetch.
    async fn pump<S: Sender>(&mut self, sender: &mut S) {
        if self.retry_at.is_some_and(|at| at > Instant::now()) {
            return;
        }
        self.retry_at = None;

        let mut wanted = Vec::new();
        let filling = self
            .requests
            .values()
            .any(|purpose| matches!(purpose, Purpose::Fill { .. }));
        if !filling && !self.halted && self.persisted < self.target && !self.tree_syncing() {
            let from = self.persisted + 1;
            let to = self
                .target
                .min(from + self.shared.max_blocks_per_response as SeqNr - 1);
            wanted.push(Purpose::Fill { from, to });
        }
        for seq_nr in self.fetches.keys() {
            let requested = self
                .requests
                .values()
                .any(|purpose| matches!(purpose, Purpose::Fetch { seq_nr: s } if s == seq_nr));
            if !requested {
                wanted.push(Purpose::Fetch { seq_nr: *seq_nr });
            }
        }

        for purpose in wanted {
            let (peer, id) = match self.requester.request(false) {
                Ok(assigned) => assigned,
                Err(requester::Error::RateLimited(wait)) => {
                    self.retry_at = Some(Instant::now() + wait);
                    return;
                }
                Err(requester::Error::NoEligibleParticipants) => return,
            };
            self.requests.insert(id, purpose);
            let (from, to) = match purpose {
                Purpose::Fill { from, to } => (from, to),
                Purpose::Fetch { seq_nr } => (seq_nr, seq_nr),
            };
            trace!(peer, from, to, "requesting blocks");
            self.send(
                sender,
                Recipients::One(peer),
                wire::Blocks::BlockSyncRequest { from, to },
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
            if let Some(purpose) = self.requests.remove(&id) {
                debug!(peer = request.participant, ?purpose, "block-sync request timed out");
            }
            self.metrics
                .responses
                .get_or_create(&StatusLabel::new(Status::Timeout))
                .inc();
            self.requester.timeout(request);
        }
    }

    ////////////////////////////////////////
    // Network
    ////////////////////////////////////////

    async fn handle_network<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        msg: wire::Blocks,
    ) {
        match msg {
            wire::Blocks::BlockSyncRequest { from, to } => {
                self.handle_request(sender, peer, from, to).await
            }
            wire::Blocks::BlockSyncResponse { from, blocks } => {
                self.handle_response(peer, from, blocks).await
            }
        }
    }

    async fn handle_request<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        from: SeqNr,
        to: SeqNr,
    ) {
        let count = (to - from).saturating_add(1).min(self.shared.max_blocks_per_response as u64);
        let blocks = match state::read_blocks(
            &self.db.read_transaction(),
            from,
            count as usize,
            &self.shared.limits,
        ) {
            Ok(blocks) => blocks,
            Err(err) => {
                error!(?err, "failed to read blocks");
                Vec::new()
            }
        };
        let (status, blocks) = if blocks.is_empty() {
            (Status::GoAway, None)
        } else {
            (Status::Success, Some(blocks))
        };
        trace!(peer, from, to, ?status, "serving blocks");
        self.metrics.served.get_or_create(&StatusLabel::new(status)).inc();
        self.send(
            sender,
            Recipients::One(peer),
            wire::Blocks::BlockSyncResponse { from, blocks },
        )
        .await;
    }

    async fn handle_response(
        &mut self,
        peer: OracleId,
        from: SeqNr,
        blocks: Option<Vec<AttestedStateTransitionBlock>>,
    ) {
        // Match the response to the request sent to this peer for `from`
        let matching = self.requests.iter().find_map(|(id, purpose)| {
            let start = match purpose {
                Purpose::Fill { from, .. } => *from,
                Purpose::Fetch { seq_nr } => *seq_nr,
            };
            (start == from).then_some(*id)
        });
        let Some(id) = matching else {
            trace!(peer, from, "unsolicited blocks");
            return;
        };
        let Some(request) = self.requester.handle(&peer, id) else {
            trace!(peer, from, "blocks from unexpected peer");
            return;
        };
        let Some(purpose) = self.requests.remove(&id) else {
            return;
        };

        let Some(blocks) = blocks else {
            debug!(peer, from, "peer went away");
            self.metrics
                .responses
                .get_or_create(&StatusLabel::new(Status::GoAway))
                .inc();
            self.requester.fail(request);
            self.requester.exclude(peer, self.fetch_timeout);
            return;
        };

        let to = match purpose {
            Purpose::Fill { to, .. } => to,
            Purpose::Fetch { seq_nr } => seq_nr,
        };
        if !self.valid(from, to, &blocks) {
            warn!(peer, from, "invalid blocks");
            self.metrics
                .responses
                .get_or_create(&StatusLabel::new(Status::Invalid))
                .inc();
            self.requester.fail(request);
            self.requester.block(peer);
            self.blocker.block(peer).await;
            return;
        }
        self.requester.resolve(request);
        self.metrics
            .responses
            .get_or_create(&StatusLabel::new(Status::Success))
            .inc();

        match purpose {
            Purpose::Fetch { seq_nr } => {
                let Some(block) = blocks.into_iter().next() else {
                    return;
                };
                for waiter in self.fetches.remove(&seq_nr).into_iter().flatten() {
                    let _ = waiter.send(block.clone());
                }
            }
            Purpose::Fill { .. } => {
                if let Err(err) = self.persist(&blocks) {
                    error!(?err, "failed to persist blocks");
                    return;
                }
                self.replay().await;
            }
        }
    }

    /// Blocks must be consecutive from `from`, within `[from, to]`, and commit-certified.
    fn valid(&self, from: SeqNr, to: SeqNr, blocks: &[AttestedStateTransitionBlock]) -> bool {
        if blocks.is_empty() || from + blocks.len() as SeqNr - 1 > to {
            return false;
        }
        blocks.iter().zip(from..).all(|(block, expected)| {
            block.block.seq_nr == expected
                && block.verify(
                    Phase::Commit,
                    &self.shared.config_digest,
                    &self.shared.oracles,
                    self.shared.quorum(),
                )
        })
    }

    /// Persist `blocks`, skipping any that would leave a gap.
    fn persist(&mut self, blocks: &[AttestedStateTransitionBlock]) -> Result<(), Error> {
        let mut txn = self.db.unserialized_transaction();
        let committed = state::read_committed(&txn)?.seq_nr;
        let mut persisted = self.persisted.max(committed);
        for block in blocks {
            let seq_nr = block.block.seq_nr;
            if seq_nr <= persisted {
                continue;
            }
            if seq_nr != persisted + 1 {
                break;
            }
            state::write_block(&mut txn, block)?;
            persisted = seq_nr;
        }
        txn.commit()?;
        if persisted > self.persisted {
            debug!(persisted, target = self.target, "persisted fetched blocks");
            self.persisted = persisted;
        }
        Ok(())
    }
}
