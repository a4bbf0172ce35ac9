use super::{
    ingress::{Mailbox, Message},
    metrics::{Metrics, Status},
    round::{Certification, FollowerPhase, LeaderPhase, ReplayMismatches},
    Config,
};
use crate::{
    attestation, pacemaker,
    plugin::{bounded, KeyValueState, Limits, Plugin, PluginError, Timeouts},
    state,
    types::{
        sign_epoch_start, verify_epoch_start, AttestedStateTransitionBlock,
        AttributedObservation, CertifiedBlock, CertifiedPrepareOrCommit, EpochStartProof,
        OutcomeContext, Phase, SignedHighestCertifiedTimestamp, StateTransitionBlock,
        StateTransitionInputs,
    },
    wire, Error, Reporter, SharedConfig,
};
use bytes::Bytes;
use futures::{channel::mpsc, StreamExt};
use ocr_codec::{Decode, Encode};
use ocr_cryptography::{PrivateKey, Signature};
use ocr_p2p::{Blocker, Receiver, Recipients, Sender};
use ocr_storage::kv::Database;
use ocr_utils::{earliest, sleep_until, ConfigDigest, Epoch, OracleId, Round, SeqNr};
use std::{
    collections::{BTreeMap, VecDeque},
    future::Future,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Result of work run off the event loop, tagged with what it was started for.
enum Background {
    Query {
        epoch: Epoch,
        round: Round,
        result: Result<Bytes, PluginError>,
    },
    Observation {
        epoch: Epoch,
        seq_nr: SeqNr,
        round: Round,
        query: Bytes,
        result: Result<Bytes, PluginError>,
    },
    Validated {
        epoch: Epoch,
        round: Round,
        observation: AttributedObservation,
        result: Result<(), PluginError>,
    },
    Quorum {
        epoch: Epoch,
        round: Round,
        checked: usize,
        result: Result<bool, PluginError>,
    },
    Transition {
        epoch: Epoch,
        round: Round,
        result: Result<StateTransitionBlock, Error>,
    },
    Replay {
        epoch: Epoch,
        certified: CertifiedBlock,
        result: Result<bool, Error>,
    },
}

/// Where committed blocks are announced.
struct Outputs<R: Reporter> {
    pacemaker: pacemaker::Mailbox,
    attestation: attestation::Mailbox,
    reporter: R,
}

/// Runs the rounds of each epoch, as leader or follower.
pub struct Actor<P: Plugin, B: Blocker> {
    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    me: OracleId,
    signer: PrivateKey,
    shared: SharedConfig,
    max_buffered_per_sender: usize,

    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    plugin: P,
    blocker: B,
    db: Database,
    mailbox_receiver: mpsc::Receiver<Message>,
    background: mpsc::UnboundedSender<Background>,
    background_receiver: mpsc::UnboundedReceiver<Background>,

    ////////////////////////////////////////
    // Epoch
    ////////////////////////////////////////
    epoch: Epoch,
    leader: OracleId,

    /// Set once the pacemaker has started the first epoch.
    active: bool,

    /// Set once re-proposals repeatedly fail to replay.
    halted: bool,
    replay_mismatches: ReplayMismatches,

    /// Messages for epochs not yet entered, per sender.
    buffered: BTreeMap<OracleId, VecDeque<wire::Outcome>>,

    ////////////////////////////////////////
    // Follower
    ////////////////////////////////////////
    phase: FollowerPhase,

    /// Set once the leader's `EpochStart` was accepted.
    epoch_started: bool,
    resend_deadline: Option<Instant>,
    round: Round,
    certification: Option<Certification>,
    last_commit_request: Option<(SeqNr, Instant)>,

    ////////////////////////////////////////
    // Leader
    ////////////////////////////////////////
    leader_phase: LeaderPhase,
    epoch_start_requests: BTreeMap<OracleId, (CertifiedPrepareOrCommit, Signature)>,
    epoch_start: Option<wire::Outcome>,
    leader_round: Round,
    leader_seq_nr: SeqNr,
    leader_query: Bytes,
    observations: BTreeMap<OracleId, AttributedObservation>,
    quorum_checking: bool,
    round_started: Option<Instant>,
    next_round_deadline: Option<Instant>,
    grace_deadline: Option<Instant>,

    metrics: Metrics,
}

impl<P: Plugin, B: Blocker> Actor<P, B> {
    pub fn new(cfg: Config<P, B>) -> (Self, Mailbox) {
        let (sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let (background, background_receiver) = mpsc::unbounded();
        let metrics = Metrics::init(&cfg.registry);
        let replay_mismatches = ReplayMismatches::new(cfg.shared.max_consecutive_replay_mismatches);
        (
            Self {
                me: cfg.me,
                signer: cfg.signer,
                shared: cfg.shared,
                max_buffered_per_sender: cfg.max_buffered_per_sender,

                plugin: cfg.plugin,
                blocker: cfg.blocker,
                db: cfg.db,
                mailbox_receiver,
                background,
                background_receiver,

                epoch: 0,
                leader: 0,
                active: false,
                halted: false,
                replay_mismatches,
                buffered: BTreeMap::new(),

                phase: FollowerPhase::NewEpoch,
                epoch_started: false,
                resend_deadline: None,
                round: 0,
                certification: None,
                last_commit_request: None,

                leader_phase: LeaderPhase::NewEpoch,
                epoch_start_requests: BTreeMap::new(),
                epoch_start: None,
                leader_round: 0,
                leader_seq_nr: 0,
                leader_query: Bytes::new(),
                observations: BTreeMap::new(),
                quorum_checking: false,
                round_started: None,
                next_round_deadline: None,
                grace_deadline: None,

                metrics,
            },
            Mailbox::new(sender),
        )
    }

    /// Spawn outcome generation on the current runtime.
    pub fn start<R: Reporter, S: Sender, Rx: Receiver>(
        self,
        pacemaker: pacemaker::Mailbox,
        attestation: attestation::Mailbox,
        reporter: R,
        network: (S, Rx),
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let outputs = Outputs {
            pacemaker,
            attestation,
            reporter,
        };
        tokio::spawn(self.run(outputs, network, cancel))
    }

    async fn run<R: Reporter, S: Sender, Rx: Receiver>(
        mut self,
        mut outputs: Outputs<R>,
        (mut sender, mut receiver): (S, Rx),
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = earliest(
                earliest(self.resend_deadline, self.next_round_deadline),
                self.grace_deadline,
            );
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("shutdown");
                    return;
                },

                mail = self.mailbox_receiver.next() => {
                    let Some(Message::StartEpoch { epoch, leader }) = mail else {
                        debug!("mailbox closed");
                        return;
                    };
                    self.handle_start_epoch(&mut sender, &mut outputs, epoch, leader).await;
                },

                Some(result) = self.background_receiver.next() => {
                    if !self.halted {
                        self.handle_background(&mut sender, &mut outputs, result).await;
                    }
                },

                msg = receiver.recv() => {
                    let (peer, msg) = match msg {
                        Ok(r) => r,
                        Err(err) => {
                            error!(?err, "receiver failed");
                            return;
                        }
                    };
                    if peer as usize >= self.shared.n() {
                        debug!(peer, "message from unknown oracle");
                        continue;
                    }
                    let msg = match wire::Outcome::decode_cfg(msg, &self.shared.limits) {
                        Ok(msg) if msg.check_size(&self.shared.limits, self.shared.n()) => msg,
                        result => {
                            warn!(err = ?result.err(), peer, "invalid message");
                            self.metrics.inbound(Status::Invalid);
                            self.blocker.block(peer).await;
                            continue;
                        }
                    };
                    self.handle_network(&mut sender, &mut outputs, peer, msg).await;
                },

                _ = sleep_until(deadline) => {
                    self.handle_deadline(&mut sender, &mut outputs).await;
                },
            }
        }
    }

    fn spawn(&self, work: impl Future<Output = Background> + Send + 'static) {
        let background = self.background.clone();
        tokio::spawn(async move {
            let _ = background.unbounded_send(work.await);
        });
    }

    async fn send<S: Sender>(&self, sender: &mut S, recipients: Recipients, msg: wire::Outcome) {
        let priority = msg.class().priority();
        if let Err(err) = sender.send(recipients, msg.encode().freeze(), priority).await {
            debug!(?err, "failed to send");
        }
    }

    fn is_leader(&self) -> bool {
        self.leader == self.me
    }

    fn context(&self, seq_nr: SeqNr, round: Round) -> OutcomeContext {
        OutcomeContext {
            seq_nr,
            epoch: self.epoch,
            round,
        }
    }

    fn committed_seq_nr(&self) -> Result<SeqNr, Error> {
        Ok(state::read_committed(&self.db.read_transaction())?.seq_nr)
    }

    ////////////////////////////////////////
    // Epochs
    ////////////////////////////////////////

    async fn handle_start_epoch<R: Reporter, S: Sender>(
        &mut self,
        sender: &mut S,
        outputs: &mut Outputs<R>,
        epoch: Epoch,
        leader: OracleId,
    ) {
        if self.active && epoch <= self.epoch {
            return;
        }
        info!(epoch, leader, "starting epoch");
        self.epoch = epoch;
        self.leader = leader;
        self.active = true;
        self.metrics.epoch.set(epoch as i64);

        self.phase = FollowerPhase::NewEpoch;
        self.epoch_started = false;
        self.round = 0;
        self.certification = None;

        self.leader_phase = LeaderPhase::NewEpoch;
        self.epoch_start_requests.clear();
        self.epoch_start = None;
        self.leader_round = 0;
        self.observations.clear();
        self.quorum_checking = false;
        self.round_started = None;
        self.next_round_deadline = None;
        self.grace_deadline = None;

        if self.halted {
            return;
        }
        self.send_epoch_start_request(sender).await;

        // Replay what arrived early, oldest first per sender
        let mut ready = Vec::new();
        for (peer, queue) in self.buffered.iter_mut() {
            let (current, later): (VecDeque<_>, VecDeque<_>) = queue
                .drain(..)
                .filter(|msg| msg.epoch().is_some_and(|e| e >= epoch))
                .partition(|msg| msg.epoch() == Some(epoch));
            *queue = later;
            ready.extend(current.into_iter().map(|msg| (*peer, msg)));
        }
        self.buffered.retain(|_, queue| !queue.is_empty());
        for (peer, msg) in ready {
            self.handle_network(sender, outputs, peer, msg).await;
        }
    }

    async fn send_epoch_start_request<S: Sender>(&mut self, sender: &mut S) {
        let highest_certified =
            match state::read_highest_certified(&self.db.read_transaction(), &self.shared.limits) {
                Ok(highest) => highest,
                Err(err) => {
                    error!(?err, "failed to read highest certified");
                    self.resend_deadline = Some(Instant::now() + self.shared.delta_resend);
                    return;
                }
            };
        let signature = sign_epoch_start(
            &self.signer,
            &self.shared.config_digest,
            self.epoch,
            &highest_certified.timestamp(),
        );
        let msg = wire::Outcome::EpochStartRequest {
            epoch: self.epoch,
            highest_certified,
            signature,
        };
        self.send(sender, Recipients::One(self.leader), msg).await;
        self.resend_deadline = Some(Instant::now() + self.shared.delta_resend);
    }

    async fn handle_epoch_start_request<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        highest_certified: CertifiedPrepareOrCommit,
        signature: Signature,
    ) {
        if !self.is_leader() {
            debug!(peer, "epoch start request sent to non-leader");
            return;
        }
        if let Some(epoch_start) = &self.epoch_start {
            // The peer missed it
            self.send(sender, Recipients::One(peer), epoch_start.clone())
                .await;
            return;
        }
        if self.epoch_start_requests.contains_key(&peer) {
            return;
        }
        let public_key = &self.shared.oracles[peer as usize];
        if !verify_epoch_start(
            public_key,
            &self.shared.config_digest,
            self.epoch,
            &highest_certified.timestamp(),
            &signature,
        ) || !highest_certified.verify(
            &self.shared.config_digest,
            &self.shared.oracles,
            self.shared.quorum(),
        ) {
            warn!(peer, epoch = self.epoch, "invalid epoch start request");
            self.metrics.inbound(Status::Invalid);
            return;
        }
        self.epoch_start_requests
            .insert(peer, (highest_certified, signature));
        if self.epoch_start_requests.len() < self.shared.quorum() {
            return;
        }

        let Some(highest_certified) = self
            .epoch_start_requests
            .values()
            .map(|(certified, _)| certified)
            .max_by_key(|certified| certified.timestamp())
            .cloned()
        else {
            return;
        };
        let highest_certified_proof = self
            .epoch_start_requests
            .iter()
            .map(|(signer, (certified, signature))| SignedHighestCertifiedTimestamp {
                signer: *signer,
                timestamp: certified.timestamp(),
                signature: *signature,
            })
            .collect();
        let msg = wire::Outcome::EpochStart {
            epoch: self.epoch,
            proof: EpochStartProof {
                highest_certified,
                highest_certified_proof,
            },
        };
        debug!(epoch = self.epoch, "sending epoch start");
        self.epoch_start = Some(msg.clone());
        self.leader_phase = LeaderPhase::SentEpochStart;
        self.send(sender, Recipients::All, msg).await;
    }

    async fn handle_epoch_start<R: Reporter, S: Sender>(
        &mut self,
        sender: &mut S,
        outputs: &mut Outputs<R>,
        peer: OracleId,
        proof: EpochStartProof,
    ) {
        if peer != self.leader || self.epoch_started {
            return;
        }
        if !proof.verify(
            &self.shared.config_digest,
            self.epoch,
            &self.shared.oracles,
            self.shared.quorum(),
        ) {
            warn!(peer, epoch = self.epoch, "invalid epoch start proof");
            self.metrics.inbound(Status::Invalid);
            return;
        }
        self.epoch_started = true;
        self.resend_deadline = None;
        debug!(
            epoch = self.epoch,
            timestamp = ?proof.highest_certified.timestamp(),
            "epoch started"
        );

        match proof.highest_certified {
            CertifiedPrepareOrCommit::Genesis => self.begin_rounds(),
            CertifiedPrepareOrCommit::Commit(attested) => {
                if let Err(err) = self.store_commit(outputs, attested).await {
                    error!(?err, "failed to store certified commit");
                }
                self.begin_rounds();
            }
            CertifiedPrepareOrCommit::Prepare(certified) => {
                self.reproposal(sender, outputs, certified).await;
            }
        }
    }

    /// Start fresh rounds after the certificate the epoch starts from.
    fn begin_rounds(&mut self) {
        self.phase = FollowerPhase::NewRound;
        if self.is_leader() {
            self.next_round_deadline = Some(Instant::now() + self.shared.delta_initial);
        }
    }

    /// Finish a block that was prepared, but maybe not committed, in an earlier epoch.
    async fn reproposal<R: Reporter, S: Sender>(
        &mut self,
        sender: &mut S,
        outputs: &mut Outputs<R>,
        certified: CertifiedBlock,
    ) {
        let seq_nr = certified.block.seq_nr;
        let committed = match state::read_committed(&self.db.read_transaction()) {
            Ok(committed) => committed,
            Err(err) => {
                error!(?err, "failed to read committed");
                return;
            }
        };
        if committed.seq_nr >= seq_nr {
            // Already applied locally; help the others finish it
            let digest = certified.block.digest(&self.shared.config_digest);
            if committed.seq_nr == seq_nr && committed.history_digest == digest {
                self.sign_commit(sender, certified.block, digest).await;
            }
            self.begin_rounds();
            return;
        }
        if committed.seq_nr + 1 < seq_nr {
            debug!(seq_nr, committed = committed.seq_nr, "behind re-proposal");
            outputs.reporter.behind(seq_nr - 1).await;
            return;
        }

        self.phase = FollowerPhase::BackgroundStateTransition;
        let db = self.db.clone();
        let epoch = self.epoch;
        self.spawn(async move {
            let result = replay(&db, &certified.block);
            Background::Replay {
                epoch,
                certified,
                result,
            }
        });
    }

    async fn handle_replay<S: Sender>(
        &mut self,
        sender: &mut S,
        certified: CertifiedBlock,
        result: Result<bool, Error>,
    ) {
        let seq_nr = certified.block.seq_nr;
        match result {
            Err(err) => {
                error!(?err, seq_nr, "failed to replay re-proposal");
            }
            Ok(false) => {
                let halt = self.replay_mismatches.mismatched();
                self.metrics.replay_mismatches.inc();
                error!(
                    seq_nr,
                    mismatches = self.replay_mismatches.consecutive(),
                    "replayed state root differs from certified state root"
                );
                if halt {
                    error!(
                        mismatches = self.replay_mismatches.consecutive(),
                        "plugin is not deterministic: halting outcome generation until restarted"
                    );
                    self.halted = true;
                }
            }
            Ok(true) => {
                self.replay_mismatches.matched();
                let block = certified.block.clone();
                let digest = block.digest(&self.shared.config_digest);
                let certified = CertifiedPrepareOrCommit::Prepare(certified);
                if let Err(err) = self.raise_highest_certified(&certified) {
                    error!(?err, "failed to persist highest certified");
                    return;
                }
                self.sign_commit(sender, block, digest).await;
            }
        }
    }

    /// Adopt `block` for its sequence number and broadcast a commit signature for it.
    async fn sign_commit<S: Sender>(
        &mut self,
        sender: &mut S,
        block: StateTransitionBlock,
        digest: ocr_cryptography::Digest,
    ) {
        let seq_nr = block.seq_nr;
        let certification = self
            .certification
            .get_or_insert_with(|| Certification::new(seq_nr));
        if certification.seq_nr != seq_nr {
            *certification = Certification::new(seq_nr);
        }
        certification.set_block(block, digest);
        certification.sent_commit = true;
        self.phase = FollowerPhase::SentCommit;
        let signature = Phase::Commit.sign(&self.signer, &self.shared.config_digest, &digest);
        let msg = wire::Outcome::Commit {
            epoch: self.epoch,
            seq_nr,
            signature,
        };
        self.send(sender, Recipients::All, msg).await;
    }

    fn raise_highest_certified(&self, certified: &CertifiedPrepareOrCommit) -> Result<(), Error> {
        let mut txn = self.db.serialized_transaction();
        let highest = state::read_highest_certified(&txn, &self.shared.limits)?;
        if certified.timestamp() <= highest.timestamp() {
            return Ok(());
        }
        state::write_highest_certified(&mut txn, certified)?;
        txn.commit()?;
        Ok(())
    }

    ////////////////////////////////////////
    // Leader
    ////////////////////////////////////////

    async fn start_round<R: Reporter>(&mut self, outputs: &mut Outputs<R>) {
        self.next_round_deadline = None;
        if self.leader_round >= self.shared.rounds_per_epoch {
            info!(epoch = self.epoch, rounds = self.leader_round, "finished leading epoch");
            outputs.pacemaker.change_leader().await;
            return;
        }
        let committed = match self.committed_seq_nr() {
            Ok(committed) => committed,
            Err(err) => {
                error!(?err, "failed to read committed");
                self.next_round_deadline = Some(Instant::now() + self.shared.delta_round);
                return;
            }
        };
        self.leader_round += 1;
        self.leader_seq_nr = committed + 1;
        self.observations.clear();
        self.quorum_checking = false;
        self.round_started = Some(Instant::now());
        self.metrics.rounds.inc();

        let context = self.context(self.leader_seq_nr, self.leader_round);
        let (plugin, db, timeout) = (
            self.plugin.clone(),
            self.db.clone(),
            self.shared.timeouts.query,
        );
        let (epoch, round) = (self.epoch, self.leader_round);
        debug!(epoch, seq_nr = context.seq_nr, round, "querying");
        self.spawn(async move {
            let state = KeyValueState::new(&db);
            let result = bounded(timeout, plugin.query(context, &state)).await;
            Background::Query {
                epoch,
                round,
                result,
            }
        });
    }

    async fn handle_query<S: Sender>(
        &mut self,
        sender: &mut S,
        result: Result<Bytes, PluginError>,
    ) {
        let query = match result {
            Ok(query) if query.len() <= self.shared.limits.max_query_length => query,
            Ok(query) => {
                warn!(len = query.len(), "query too large");
                self.next_round_deadline = Some(Instant::now() + self.shared.delta_round);
                return;
            }
            Err(err) => {
                warn!(?err, "query failed");
                self.next_round_deadline = Some(Instant::now() + self.shared.delta_round);
                return;
            }
        };
        self.leader_query = query.clone();
        self.leader_phase = LeaderPhase::SentRoundStart;
        let msg = wire::Outcome::RoundStart {
            epoch: self.epoch,
            seq_nr: self.leader_seq_nr,
            round: self.leader_round,
            query,
        };
        self.send(sender, Recipients::All, msg).await;
    }

    fn handle_observation(
        &mut self,
        peer: OracleId,
        seq_nr: SeqNr,
        round: Round,
        observation: AttributedObservation,
    ) {
        if !self.is_leader()
            || !matches!(self.leader_phase, LeaderPhase::SentRoundStart | LeaderPhase::Grace)
            || seq_nr != self.leader_seq_nr
            || round != self.leader_round
        {
            trace!(peer, seq_nr, round, "unexpected observation");
            return;
        }
        if observation.observer != peer || self.observations.contains_key(&peer) {
            return;
        }
        let context = self.context(seq_nr, round);
        if !observation.verify(
            &self.shared.oracles[peer as usize],
            &self.shared.config_digest,
            &context,
            &self.leader_query,
        ) {
            warn!(peer, seq_nr, round, "invalid observation signature");
            self.metrics.inbound(Status::Invalid);
            return;
        }
        let (plugin, db, timeout) = (
            self.plugin.clone(),
            self.db.clone(),
            self.shared.timeouts.validate_observation,
        );
        let (epoch, query) = (self.epoch, self.leader_query.clone());
        self.spawn(async move {
            let state = KeyValueState::new(&db);
            let result = bounded(
                timeout,
                plugin.validate_observation(context, &query, &observation, &state),
            )
            .await;
            Background::Validated {
                epoch,
                round,
                observation,
                result,
            }
        });
    }

    fn check_quorum(&mut self) {
        self.quorum_checking = true;
        let observations: Vec<_> = self.observations.values().cloned().collect();
        let checked = observations.len();
        let context = self.context(self.leader_seq_nr, self.leader_round);
        let (plugin, db, timeout) = (
            self.plugin.clone(),
            self.db.clone(),
            self.shared.timeouts.observation_quorum,
        );
        let (epoch, round, query) = (self.epoch, self.leader_round, self.leader_query.clone());
        self.spawn(async move {
            let state = KeyValueState::new(&db);
            let result = bounded(
                timeout,
                plugin.observation_quorum(context, &query, &observations, &state),
            )
            .await;
            Background::Quorum {
                epoch,
                round,
                checked,
                result,
            }
        });
    }

    async fn send_proposal<S: Sender>(&mut self, sender: &mut S) {
        self.grace_deadline = None;
        self.leader_phase = LeaderPhase::SentProposal;
        let msg = wire::Outcome::Proposal {
            epoch: self.epoch,
            seq_nr: self.leader_seq_nr,
            round: self.leader_round,
            query: self.leader_query.clone(),
            attributed_observations: self.observations.values().cloned().collect(),
        };
        debug!(
            epoch = self.epoch,
            seq_nr = self.leader_seq_nr,
            observations = self.observations.len(),
            "sending proposal"
        );
        self.send(sender, Recipients::All, msg).await;
    }

    ////////////////////////////////////////
    // Follower
    ////////////////////////////////////////

    /// Check that `seq_nr` is the next block to apply, asking for what is missing otherwise.
    async fn is_next<S: Sender>(&mut self, sender: &mut S, seq_nr: SeqNr) -> bool {
        let committed = match self.committed_seq_nr() {
            Ok(committed) => committed,
            Err(err) => {
                error!(?err, "failed to read committed");
                return false;
            }
        };
        if seq_nr > committed + 1 {
            self.request_certified_commit(sender, seq_nr - 1).await;
            return false;
        }
        seq_nr == committed + 1
    }

    async fn request_certified_commit<S: Sender>(&mut self, sender: &mut S, seq_nr: SeqNr) {
        let now = Instant::now();
        if let Some((requested, at)) = self.last_commit_request {
            if requested == seq_nr && now < at + self.shared.delta_certified_commit_request {
                return;
            }
        }
        debug!(seq_nr, leader = self.leader, "requesting certified commit");
        self.last_commit_request = Some((seq_nr, now));
        let msg = wire::Outcome::CertifiedCommitRequest { seq_nr };
        self.send(sender, Recipients::One(self.leader), msg).await;
    }

    async fn handle_round_start<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        seq_nr: SeqNr,
        round: Round,
        query: Bytes,
    ) {
        if peer != self.leader || !self.epoch_started || round <= self.round {
            trace!(peer, seq_nr, round, "unexpected round start");
            return;
        }
        if !self.is_next(sender, seq_nr).await {
            return;
        }
        self.round = round;
        self.phase = FollowerPhase::BackgroundObservation;
        let context = self.context(seq_nr, round);
        let (plugin, db, timeout) = (
            self.plugin.clone(),
            self.db.clone(),
            self.shared.timeouts.observation,
        );
        let epoch = self.epoch;
        self.spawn(async move {
            let state = KeyValueState::new(&db);
            let result = bounded(timeout, plugin.observation(context, &query, &state)).await;
            Background::Observation {
                epoch,
                seq_nr,
                round,
                query,
                result,
            }
        });
    }

    async fn send_observation<S: Sender>(
        &mut self,
        sender: &mut S,
        seq_nr: SeqNr,
        query: Bytes,
        result: Result<Bytes, PluginError>,
    ) {
        let observation = match result {
            Ok(observation) if observation.len() <= self.shared.limits.max_observation_length => {
                observation
            }
            Ok(observation) => {
                warn!(len = observation.len(), "observation too large");
                return;
            }
            Err(err) => {
                warn!(?err, "observation failed");
                return;
            }
        };
        let context = self.context(seq_nr, self.round);
        let observation = AttributedObservation::sign(
            &self.signer,
            self.me,
            &self.shared.config_digest,
            &context,
            &query,
            observation,
        );
        self.phase = FollowerPhase::SentObservation;
        let msg = wire::Outcome::Observation {
            epoch: self.epoch,
            seq_nr,
            round: self.round,
            observation,
        };
        self.send(sender, Recipients::One(self.leader), msg).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_proposal<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        seq_nr: SeqNr,
        round: Round,
        query: Bytes,
        attributed_observations: Vec<AttributedObservation>,
    ) {
        if peer != self.leader || !self.epoch_started {
            return;
        }
        if round < self.round
            || (round == self.round && self.phase >= FollowerPhase::BackgroundStateTransition)
        {
            trace!(peer, seq_nr, round, "stale proposal");
            return;
        }
        if !self.is_next(sender, seq_nr).await {
            return;
        }
        if self
            .certification
            .as_ref()
            .is_some_and(|c| c.seq_nr == seq_nr && c.block().is_some())
        {
            return;
        }

        let n = self.shared.n();
        let sorted = attributed_observations
            .windows(2)
            .all(|pair| pair[0].observer < pair[1].observer);
        let context = self.context(seq_nr, round);
        let valid = sorted
            && attributed_observations.iter().all(|observation| {
                (observation.observer as usize) < n
                    && observation.verify(
                        &self.shared.oracles[observation.observer as usize],
                        &self.shared.config_digest,
                        &context,
                        &query,
                    )
            });
        if !valid {
            warn!(peer, seq_nr, round, "invalid proposal");
            self.metrics.inbound(Status::Invalid);
            return;
        }

        self.round = round;
        self.phase = FollowerPhase::BackgroundStateTransition;
        let inputs = StateTransitionInputs {
            seq_nr,
            epoch: self.epoch,
            round,
            query,
            attributed_observations,
        };
        let (plugin, db) = (self.plugin.clone(), self.db.clone());
        let (config_digest, timeouts, limits) = (
            self.shared.config_digest,
            self.shared.timeouts,
            self.shared.limits,
        );
        let epoch = self.epoch;
        self.spawn(async move {
            let result = transition(plugin, db, config_digest, timeouts, limits, inputs).await;
            Background::Transition {
                epoch,
                round,
                result,
            }
        });
    }

    async fn send_prepare<R: Reporter, S: Sender>(
        &mut self,
        sender: &mut S,
        outputs: &mut Outputs<R>,
        block: StateTransitionBlock,
    ) {
        let seq_nr = block.seq_nr;
        let digest = block.digest(&self.shared.config_digest);
        let certification = self
            .certification
            .get_or_insert_with(|| Certification::new(seq_nr));
        if certification.seq_nr != seq_nr {
            *certification = Certification::new(seq_nr);
        }
        certification.set_block(block, digest);
        self.phase = FollowerPhase::SentPrepare;
        let signature = Phase::Prepare.sign(&self.signer, &self.shared.config_digest, &digest);
        let msg = wire::Outcome::Prepare {
            epoch: self.epoch,
            seq_nr,
            signature,
        };
        self.send(sender, Recipients::All, msg).await;
        self.check_certification(sender, outputs).await;
    }

    async fn handle_signature<R: Reporter, S: Sender>(
        &mut self,
        sender: &mut S,
        outputs: &mut Outputs<R>,
        peer: OracleId,
        phase: Phase,
        seq_nr: SeqNr,
        signature: Signature,
    ) {
        let current = self.certification.as_ref().map(|c| c.seq_nr);
        if current != Some(seq_nr) {
            match self.committed_seq_nr() {
                Ok(committed) if seq_nr == committed + 1 => {
                    self.certification = Some(Certification::new(seq_nr));
                }
                Ok(_) => {
                    trace!(peer, seq_nr, ?phase, "signature for other block");
                    return;
                }
                Err(err) => {
                    error!(?err, "failed to read committed");
                    return;
                }
            }
        }
        if let Some(certification) = self.certification.as_mut() {
            certification.add(peer, phase, signature);
        }
        self.check_certification(sender, outputs).await;
    }

    /// Advance the current block through prepare and commit as signatures accumulate.
    async fn check_certification<R: Reporter, S: Sender>(
        &mut self,
        sender: &mut S,
        outputs: &mut Outputs<R>,
    ) {
        let quorum = self.shared.quorum();
        let Some(certification) = self.certification.as_mut() else {
            return;
        };
        for _ in certification.verify(&self.shared.config_digest, &self.shared.oracles) {
            self.metrics.inbound(Status::Dropped);
        }

        let Some(certification) = self.certification.as_mut() else {
            return;
        };
        if !certification.sent_commit {
            if let Some(prepared) = certification.certificate(Phase::Prepare, quorum) {
                certification.sent_commit = true;
                let seq_nr = prepared.block.seq_nr;
                let digest = prepared.block.digest(&self.shared.config_digest);
                let certified = CertifiedPrepareOrCommit::Prepare(prepared);
                if let Err(err) = self.raise_highest_certified(&certified) {
                    error!(?err, seq_nr, "failed to persist certified prepare");
                    return;
                }
                debug!(epoch = self.epoch, seq_nr, "prepared");
                self.phase = FollowerPhase::SentCommit;
                let signature =
                    Phase::Commit.sign(&self.signer, &self.shared.config_digest, &digest);
                let msg = wire::Outcome::Commit {
                    epoch: self.epoch,
                    seq_nr,
                    signature,
                };
                self.send(sender, Recipients::All, msg).await;
            }
        }

        let Some(certification) = self.certification.as_mut() else {
            return;
        };
        if certification.done {
            return;
        }
        let Some(attested) = certification.certificate(Phase::Commit, quorum) else {
            return;
        };
        certification.done = true;
        let seq_nr = attested.block.seq_nr;
        if let Err(err) = self.store_commit(outputs, attested).await {
            error!(?err, seq_nr, "failed to store commit");
            return;
        }
        if self.is_leader() {
            let earliest_next = self
                .round_started
                .map(|started| started + self.shared.delta_round)
                .unwrap_or_else(Instant::now);
            self.next_round_deadline = Some(earliest_next.max(Instant::now()));
        }
    }

    /// Persist a committed block and, if it is next, apply it.
    async fn store_commit<R: Reporter>(
        &mut self,
        outputs: &mut Outputs<R>,
        attested: AttestedStateTransitionBlock,
    ) -> Result<(), Error> {
        let seq_nr = attested.block.seq_nr;
        let mut txn = self.db.serialized_transaction();
        let committed = state::read_committed(&txn)?;
        if seq_nr <= committed.seq_nr {
            return Ok(());
        }
        let gap_free = seq_nr == committed.seq_nr + 1
            || state::read_block(&txn, seq_nr - 1, &self.shared.limits)?.is_some();
        if !gap_free {
            debug!(seq_nr, committed = committed.seq_nr, "missing blocks before commit");
            outputs.reporter.behind(seq_nr).await;
            return Ok(());
        }

        state::write_block(&mut txn, &attested)?;
        let apply = seq_nr == committed.seq_nr + 1;
        if apply {
            state::apply_block(&mut txn, &self.shared.config_digest, &attested.block)?;
        }
        let reports_plus_precursor = attested.block.reports_plus_precursor.clone();
        let highest = state::read_highest_certified(&txn, &self.shared.limits)?;
        let certified = CertifiedPrepareOrCommit::Commit(attested);
        if certified.timestamp() > highest.timestamp() {
            state::write_highest_certified(&mut txn, &certified)?;
        }
        txn.commit()?;

        outputs.reporter.persisted(seq_nr).await;
        if !apply {
            return Ok(());
        }
        info!(epoch = self.epoch, seq_nr, "committed");
        self.metrics.committed.set(seq_nr as i64);
        outputs.reporter.committed(seq_nr).await;
        outputs
            .attestation
            .committed(seq_nr, reports_plus_precursor)
            .await;
        outputs.pacemaker.progress().await;
        Ok(())
    }

    ////////////////////////////////////////
    // Certified commits
    ////////////////////////////////////////

    async fn handle_certified_commit_request<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        seq_nr: SeqNr,
    ) {
        let read = state::read_block(&self.db.read_transaction(), seq_nr, &self.shared.limits);
        let block = match read {
            Ok(Some(block)) => block,
            Ok(None) => {
                debug!(peer, seq_nr, "requested commit not held");
                return;
            }
            Err(err) => {
                error!(?err, seq_nr, "failed to read block");
                return;
            }
        };
        self.send(sender, Recipients::One(peer), wire::Outcome::CertifiedCommit(block))
            .await;
    }

    async fn handle_certified_commit<R: Reporter>(
        &mut self,
        outputs: &mut Outputs<R>,
        peer: OracleId,
        attested: AttestedStateTransitionBlock,
    ) {
        if !attested.verify(
            Phase::Commit,
            &self.shared.config_digest,
            &self.shared.oracles,
            self.shared.quorum(),
        ) {
            warn!(peer, seq_nr = attested.block.seq_nr, "invalid certified commit");
            self.metrics.inbound(Status::Invalid);
            self.blocker.block(peer).await;
            return;
        }
        let seq_nr = attested.block.seq_nr;
        if let Err(err) = self.store_commit(outputs, attested).await {
            error!(?err, seq_nr, "failed to store certified commit");
        }
    }

    ////////////////////////////////////////
    // Dispatch
    ////////////////////////////////////////

    fn buffer(&mut self, peer: OracleId, msg: wire::Outcome) {
        let queue = self.buffered.entry(peer).or_default();
        queue.push_back(msg);
        self.metrics.inbound(Status::Buffered);
        if queue.len() > self.max_buffered_per_sender {
            queue.pop_front();
            self.metrics.inbound(Status::Dropped);
        }
    }

    async fn handle_network<R: Reporter, S: Sender>(
        &mut self,
        sender: &mut S,
        outputs: &mut Outputs<R>,
        peer: OracleId,
        msg: wire::Outcome,
    ) {
        if let wire::Outcome::CertifiedCommitRequest { seq_nr } = msg {
            self.handle_certified_commit_request(sender, peer, seq_nr).await;
            return;
        }
        if self.halted {
            return;
        }
        if let Some(epoch) = msg.epoch() {
            if epoch < self.epoch && self.active {
                trace!(peer, epoch, "message for past epoch");
                self.metrics.inbound(Status::Dropped);
                return;
            }
            if epoch > self.epoch || !self.active {
                self.buffer(peer, msg);
                return;
            }
        }
        self.metrics.inbound(Status::Processed);

        match msg {
            wire::Outcome::EpochStartRequest {
                highest_certified,
                signature,
                ..
            } => {
                self.handle_epoch_start_request(sender, peer, highest_certified, signature)
                    .await;
            }
            wire::Outcome::EpochStart { proof, .. } => {
                self.handle_epoch_start(sender, outputs, peer, proof).await;
            }
            wire::Outcome::RoundStart {
                seq_nr,
                round,
                query,
                ..
            } => {
                self.handle_round_start(sender, peer, seq_nr, round, query)
                    .await;
            }
            wire::Outcome::Observation {
                seq_nr,
                round,
                observation,
                ..
            } => {
                self.handle_observation(peer, seq_nr, round, observation);
            }
            wire::Outcome::Proposal {
                seq_nr,
                round,
                query,
                attributed_observations,
                ..
            } => {
                self.handle_proposal(sender, peer, seq_nr, round, query, attributed_observations)
                    .await;
            }
            wire::Outcome::Prepare {
                seq_nr, signature, ..
            } => {
                self.handle_signature(sender, outputs, peer, Phase::Prepare, seq_nr, signature)
                    .await;
            }
            wire::Outcome::Commit {
                seq_nr, signature, ..
            } => {
                self.handle_signature(sender, outputs, peer, Phase::Commit, seq_nr, signature)
                    .await;
            }
            wire::Outcome::CertifiedCommit(attested) => {
                self.handle_certified_commit(outputs, peer, attested).await;
            }
            wire::Outcome::CertifiedCommitRequest { .. } => unreachable!(),
        }
    }

    async fn handle_background<R: Reporter, S: Sender>(
        &mut self,
        sender: &mut S,
        outputs: &mut Outputs<R>,
        result: Background,
    ) {
        match result {
            Background::Query {
                epoch,
                round,
                result,
            } => {
                if epoch == self.epoch && round == self.leader_round && self.is_leader() {
                    self.handle_query(sender, result).await;
                }
            }
            Background::Observation {
                epoch,
                seq_nr,
                round,
                query,
                result,
            } => {
                if epoch == self.epoch
                    && round == self.round
                    && self.phase == FollowerPhase::BackgroundObservation
                {
                    self.send_observation(sender, seq_nr, query, result).await;
                }
            }
            Background::Validated {
                epoch,
                round,
                observation,
                result,
            } => {
                if epoch != self.epoch || round != self.leader_round {
                    return;
                }
                if let Err(err) = result {
                    warn!(?err, observer = observation.observer, "observation rejected");
                    return;
                }
                if !matches!(self.leader_phase, LeaderPhase::SentRoundStart | LeaderPhase::Grace) {
                    return;
                }
                self.observations.insert(observation.observer, observation);
                if self.leader_phase == LeaderPhase::SentRoundStart && !self.quorum_checking {
                    self.check_quorum();
                }
            }
            Background::Quorum {
                epoch,
                round,
                checked,
                result,
            } => {
                if epoch != self.epoch || round != self.leader_round {
                    return;
                }
                self.quorum_checking = false;
                if self.leader_phase != LeaderPhase::SentRoundStart {
                    return;
                }
                match result {
                    Ok(true) => {
                        trace!(observations = checked, "observation quorum reached");
                        self.leader_phase = LeaderPhase::Grace;
                        self.grace_deadline = Some(Instant::now() + self.shared.delta_grace);
                    }
                    Ok(false) if self.observations.len() > checked => self.check_quorum(),
                    Ok(false) => {}
                    Err(err) => warn!(?err, "observation quorum failed"),
                }
            }
            Background::Transition {
                epoch,
                round,
                result,
            } => {
                if epoch != self.epoch
                    || round != self.round
                    || self.phase != FollowerPhase::BackgroundStateTransition
                {
                    return;
                }
                match result {
                    Ok(block) => self.send_prepare(sender, outputs, block).await,
                    Err(err) => {
                        warn!(?err, epoch, round, "state transition failed");
                        self.phase = FollowerPhase::NewRound;
                    }
                }
            }
            Background::Replay {
                epoch,
                certified,
                result,
            } => {
                if epoch == self.epoch && self.phase == FollowerPhase::BackgroundStateTransition {
                    self.handle_replay(sender, certified, result).await;
                }
            }
        }
    }

    async fn handle_deadline<R: Reporter, S: Sender>(
        &mut self,
        sender: &mut S,
        outputs: &mut Outputs<R>,
    ) {
        let now = Instant::now();
        if self.resend_deadline.is_some_and(|d| d <= now) {
            self.resend_deadline = None;
            if !self.epoch_started && !self.halted {
                trace!(epoch = self.epoch, "resending epoch start request");
                self.send_epoch_start_request(sender).await;
            }
        }
        if self.grace_deadline.is_some_and(|d| d <= now) {
            self.send_proposal(sender).await;
        }
        if self.next_round_deadline.is_some_and(|d| d <= now) {
            if self.halted {
                self.next_round_deadline = None;
            } else {
                self.start_round(outputs).await;
            }
        }
    }
}

/// Whether re-applying `block` on top of the committed state reproduces its state root.
fn replay(db: &Database, block: &StateTransitionBlock) -> Result<bool, Error> {
    let txn = db.read_transaction();
    let committed = state::read_committed(&txn)?;
    if committed.seq_nr + 1 != block.seq_nr || committed.history_digest != block.prev_history_digest
    {
        return Ok(false);
    }
    let (state_root, _) = state::compute_state_root(&txn, block.seq_nr, &block.write_set)?;
    Ok(state_root == block.state_root)
}

/// Validate a proposal's inputs and run the plugin's state transition over them.
async fn transition<P: Plugin>(
    plugin: P,
    db: Database,
    config_digest: ConfigDigest,
    timeouts: Timeouts,
    limits: Limits,
    inputs: StateTransitionInputs,
) -> Result<StateTransitionBlock, Error> {
    let context = inputs.context();
    let mut kv = KeyValueState::new(&db);
    for observation in inputs.attributed_observations.iter() {
        bounded(
            timeouts.validate_observation,
            plugin.validate_observation(context, &inputs.query, observation, &kv),
        )
        .await?;
    }
    let quorum = bounded(
        timeouts.observation_quorum,
        plugin.observation_quorum(context, &inputs.query, &inputs.attributed_observations, &kv),
    )
    .await?;
    if !quorum {
        return Err(PluginError::Failed("observation quorum not reached".into()).into());
    }
    let reports_plus_precursor = bounded(
        timeouts.state_transition,
        plugin.state_transition(&inputs, &mut kv),
    )
    .await?;
    if reports_plus_precursor.len() > limits.max_reports_plus_precursor_length {
        return Err(PluginError::Failed("reports plus precursor too large".into()).into());
    }
    let write_set = kv.into_write_set();
    if !write_set.check_size(&limits) {
        return Err(PluginError::Failed("write set too large".into()).into());
    }

    let txn = db.read_transaction();
    let committed = state::read_committed(&txn)?;
    if committed.seq_nr + 1 != inputs.seq_nr {
        return Err(Error::OutOfOrder {
            expected: committed.seq_nr + 1,
            got: inputs.seq_nr,
        });
    }
    let (state_root, _) = state::compute_state_root(&txn, inputs.seq_nr, &write_set)?;
    Ok(StateTransitionBlock {
        epoch: inputs.epoch,
        seq_nr: inputs.seq_nr,
        prev_history_digest: committed.history_digest,
        inputs_digest: inputs.digest(&config_digest),
        write_set,
        state_root,
        reports_plus_precursor,
    })
}
