//! Agree on the outcome of each round and certify it as a block.
//!
//! # Design
//!
//! An epoch starts when every oracle sends the leader its highest certificate
//! (`EpochStartRequest`). Once byz-quorum-many requests arrive, the leader broadcasts an
//! `EpochStart` carrying the highest of them along with the signed claims that prove it is the
//! highest. Oracles that hear nothing resend their request every `delta_resend`.
//!
//! If the epoch starts from a prepared (but possibly uncommitted) block, every oracle replays
//! it against its own state. A replay that reproduces the certified state root is signed for
//! commit. A replay that does not is logged. After `max_consecutive_replay_mismatches` of them
//! in a row the oracle stops participating until an operator restarts it, since its plugin
//! cannot be trusted to be deterministic.
//!
//! Each round then runs as follows:
//!
//! ```txt
//! leader                                  followers (the leader included)
//!   | -- RoundStart(query) -------------------> |
//!   | <------------------- Observation (signed) |
//!   |   (quorum reached, wait delta_grace)      |
//!   | -- Proposal(observations) --------------> |  run state transition
//!   |                                           | -- Prepare --> all
//!   |                                           | -- Commit ---> all (after a prepare quorum)
//!   |                                           |  persist and apply (after a commit quorum)
//! ```
//!
//! The leader starts the next round `delta_round` after the previous one started, or as soon
//! as the previous block commits if that takes longer. After `rounds_per_epoch` rounds the
//! leader asks the pacemaker for a new epoch.
//!
//! Oracles that fall behind ask the leader for the `CertifiedCommit` just before the round
//! they were invited to, and report larger gaps through [Reporter::behind](crate::Reporter).
//!
//! Plugin calls run in spawned tasks so that a slow plugin never stalls message handling.
//! Their results carry the epoch and round they were started for and are ignored once stale.

mod actor;
mod ingress;
mod metrics;
mod round;

pub use actor::Actor;
pub use ingress::{Mailbox, Message};

use crate::{Plugin, SharedConfig};
use ocr_cryptography::PrivateKey;
use ocr_p2p::Blocker;
use ocr_storage::kv::Database;
use ocr_utils::OracleId;
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex};

/// Configuration for outcome generation.
pub struct Config<P: Plugin, B: Blocker> {
    pub me: OracleId,
    pub signer: PrivateKey,
    pub shared: SharedConfig,
    pub plugin: P,

    /// Blocks oracles that send malformed messages or invalid signatures.
    pub blocker: B,

    pub db: Database,

    /// Messages held per sender for epochs this oracle has not entered yet.
    pub max_buffered_per_sender: usize,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    pub registry: Arc<Mutex<Registry>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        attestation,
        mocks::CounterPlugin,
        pacemaker,
        state,
        types::{
            sign_epoch_start, AttributedObservation, CertifiedBlock, CertifiedPrepareOrCommit,
            EpochStartProof, OutcomeContext, Phase, SignedHighestCertifiedTimestamp,
            StateTransitionBlock, WriteSet,
        },
        wire, KeyValueState, Reporter,
    };
    use bytes::Bytes;
    use futures::{channel::mpsc, StreamExt};
    use ocr_codec::{Decode, Encode};
    use ocr_cryptography::{hash, Digest};
    use ocr_p2p::{
        simulated::{self, Link, Network},
        Receiver as _, Recipients, Sender as _,
    };
    use ocr_utils::{ConfigDigest, Epoch, Round, SeqNr};
    use prometheus_client::encoding::text::encode;
    use std::{collections::BTreeMap, time::Duration};
    use tokio_util::sync::CancellationToken;

    const N: u32 = 4;
    const F: u32 = 1;
    const PACEMAKER: u32 = 0;
    const OUTCOME: u32 = 1;

    fn shared() -> SharedConfig {
        let oracles = (0..N as u64)
            .map(|i| PrivateKey::from_seed(i).public_key())
            .collect();
        let mut shared = SharedConfig::new(ConfigDigest([3u8; 32]), oracles, F);
        shared.delta_progress = Duration::from_secs(30);
        shared
    }

    #[derive(Clone, Debug, PartialEq, Eq)]
    enum Event {
        Persisted(SeqNr),
        Behind(SeqNr),
        Committed(SeqNr),
    }

    #[derive(Clone)]
    struct Recorder(mpsc::UnboundedSender<Event>);

    impl Reporter for Recorder {
        async fn persisted(&mut self, seq_nr: SeqNr) {
            let _ = self.0.unbounded_send(Event::Persisted(seq_nr));
        }

        async fn behind(&mut self, seq_nr: SeqNr) {
            let _ = self.0.unbounded_send(Event::Behind(seq_nr));
        }

        async fn committed(&mut self, seq_nr: SeqNr) {
            let _ = self.0.unbounded_send(Event::Committed(seq_nr));
        }
    }

    struct Committee {
        oracle: simulated::Oracle,
        dbs: Vec<Database>,
        registries: Vec<Arc<Mutex<Registry>>>,
        committed: Vec<mpsc::Receiver<attestation::Message>>,
        events: Vec<mpsc::UnboundedReceiver<Event>>,
        cancel: CancellationToken,
    }

    /// Start pacemaker and outcome generation on every oracle, linking all but `isolated`.
    async fn committee(
        shared: SharedConfig,
        dbs: Vec<Database>,
        isolated: Option<u32>,
    ) -> Committee {
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let mut committee = Committee {
            oracle: oracle.clone(),
            dbs: dbs.clone(),
            registries: Vec::new(),
            committed: Vec::new(),
            events: Vec::new(),
            cancel: cancel.clone(),
        };
        for (i, db) in (0..N).zip(dbs) {
            let registry = Arc::new(Mutex::new(Registry::default()));
            let (pacemaker, pacemaker_mailbox) = pacemaker::Actor::new(pacemaker::Config {
                me: i,
                shared: shared.clone(),
                db: db.clone(),
                mailbox_size: 16,
                registry: registry.clone(),
            })
            .unwrap();
            let (outcome, outcome_mailbox) = Actor::new(Config {
                me: i,
                signer: PrivateKey::from_seed(i as u64),
                shared: shared.clone(),
                plugin: CounterPlugin::new(i, N, F),
                blocker: oracle.control(i),
                db,
                max_buffered_per_sender: 16,
                mailbox_size: 16,
                registry: registry.clone(),
            });
            let (attestation_sender, attestation_receiver) = mpsc::channel(1024);
            let (event_sender, event_receiver) = mpsc::unbounded();

            let pacemaker_channels = oracle.register(i, PACEMAKER, 1 << 20).await.unwrap();
            let outcome_channels = oracle.register(i, OUTCOME, 1 << 20).await.unwrap();
            pacemaker.start(outcome_mailbox, pacemaker_channels, cancel.clone());
            outcome.start(
                pacemaker_mailbox,
                attestation::Mailbox::new(attestation_sender),
                Recorder(event_sender),
                outcome_channels,
                cancel.clone(),
            );
            committee.registries.push(registry);
            committee.committed.push(attestation_receiver);
            committee.events.push(event_receiver);
        }
        for i in 0..N {
            for j in 0..N {
                if i != j && isolated != Some(i) && isolated != Some(j) {
                    oracle.add_link(i, j, Link::instant()).await.unwrap();
                }
            }
        }
        committee
    }

    fn fresh() -> Vec<Database> {
        (0..N).map(|_| Database::new()).collect()
    }

    /// Databases in which every oracle already holds a prepare certificate for `block`.
    fn prepared(shared: &SharedConfig, block: StateTransitionBlock) -> Vec<Database> {
        let digest = block.digest(&shared.config_digest);
        let signatures = (0..N)
            .map(|i| {
                let signer = PrivateKey::from_seed(i as u64);
                (i, Phase::Prepare.sign(&signer, &shared.config_digest, &digest))
            })
            .collect();
        let prepared = CertifiedPrepareOrCommit::Prepare(CertifiedBlock { block, signatures });
        let dbs = fresh();
        for db in dbs.iter() {
            let mut txn = db.serialized_transaction();
            state::write_highest_certified(&mut txn, &prepared).unwrap();
            txn.commit().unwrap();
        }
        dbs
    }

    /// Oracle played by the test instead of an actor.
    const MANUAL: OracleId = N - 1;

    /// Records every (blocker, blocked) pair.
    #[derive(Clone)]
    struct Blocked {
        me: OracleId,
        sender: mpsc::UnboundedSender<(OracleId, OracleId)>,
    }

    impl Blocker for Blocked {
        async fn block(&mut self, peer: OracleId) {
            let _ = self.sender.unbounded_send((self.me, peer));
        }
    }

    /// Outcome generation on every oracle but [MANUAL], with epochs started by the test.
    struct Manual {
        mailboxes: Vec<Mailbox>,
        registries: Vec<Arc<Mutex<Registry>>>,
        committed: Vec<mpsc::Receiver<attestation::Message>>,
        blocked: mpsc::UnboundedReceiver<(OracleId, OracleId)>,
        sender: simulated::Sender,
        receiver: simulated::Receiver,
        _pacemakers: Vec<mpsc::Receiver<pacemaker::Message>>,
        cancel: CancellationToken,
    }

    impl Manual {
        async fn start_epoch(&mut self, epoch: Epoch, leader: OracleId) {
            for mailbox in self.mailboxes.iter_mut() {
                mailbox.start_epoch(epoch, leader).await;
            }
        }

        async fn send(&mut self, recipients: Recipients, msg: wire::Outcome) {
            self.sender
                .send(recipients, msg.encode().freeze(), true)
                .await
                .unwrap();
        }

        /// Next message sent to [MANUAL] by an actor.
        async fn recv(&mut self, shared: &SharedConfig) -> (OracleId, wire::Outcome) {
            loop {
                let (peer, msg) = self.receiver.recv().await.unwrap();
                if peer != MANUAL {
                    return (peer, wire::Outcome::decode_cfg(msg, &shared.limits).unwrap());
                }
            }
        }
    }

    async fn manual(shared: SharedConfig, max_buffered_per_sender: usize) -> Manual {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let (blocked_sender, blocked) = mpsc::unbounded();
        let mut mailboxes = Vec::new();
        let mut registries = Vec::new();
        let mut committed = Vec::new();
        let mut pacemakers = Vec::new();
        for i in 0..MANUAL {
            let registry = Arc::new(Mutex::new(Registry::default()));
            let (outcome, mailbox) = Actor::new(Config {
                me: i,
                signer: PrivateKey::from_seed(i as u64),
                shared: shared.clone(),
                plugin: CounterPlugin::new(i, N, F),
                blocker: Blocked {
                    me: i,
                    sender: blocked_sender.clone(),
                },
                db: Database::new(),
                max_buffered_per_sender,
                mailbox_size: 16,
                registry: registry.clone(),
            });
            let (pacemaker_sender, pacemaker_receiver) = mpsc::channel(1024);
            let (attestation_sender, attestation_receiver) = mpsc::channel(1024);
            let (event_sender, _) = mpsc::unbounded();
            outcome.start(
                pacemaker::Mailbox::new(pacemaker_sender),
                attestation::Mailbox::new(attestation_sender),
                Recorder(event_sender),
                oracle.register(i, OUTCOME, 1 << 20).await.unwrap(),
                cancel.clone(),
            );
            mailboxes.push(mailbox);
            registries.push(registry);
            committed.push(attestation_receiver);
            pacemakers.push(pacemaker_receiver);
        }
        let (sender, receiver) = oracle.register(MANUAL, OUTCOME, 1 << 20).await.unwrap();
        for i in 0..N {
            for j in 0..N {
                if i != j {
                    oracle.add_link(i, j, Link::instant()).await.unwrap();
                }
            }
        }
        Manual {
            mailboxes,
            registries,
            committed,
            blocked,
            sender,
            receiver,
            _pacemakers: pacemakers,
            cancel,
        }
    }

    /// An epoch start from genesis, with the claims of the first quorum of oracles.
    fn genesis_epoch_start(shared: &SharedConfig, epoch: Epoch) -> wire::Outcome {
        let timestamp = CertifiedPrepareOrCommit::Genesis.timestamp();
        let highest_certified_proof = (0..shared.quorum() as OracleId)
            .map(|signer| SignedHighestCertifiedTimestamp {
                signer,
                timestamp,
                signature: sign_epoch_start(
                    &PrivateKey::from_seed(signer as u64),
                    &shared.config_digest,
                    epoch,
                    &timestamp,
                ),
            })
            .collect();
        wire::Outcome::EpochStart {
            epoch,
            proof: EpochStartProof {
                highest_certified: CertifiedPrepareOrCommit::Genesis,
                highest_certified_proof,
            },
        }
    }

    /// A proposal for the first block built from the observations of `observers`.
    fn proposal(
        shared: &SharedConfig,
        epoch: Epoch,
        round: Round,
        observers: &[OracleId],
    ) -> wire::Outcome {
        let context = OutcomeContext {
            seq_nr: 1,
            epoch,
            round,
        };
        let query = Bytes::from_static(b"query");
        let attributed_observations = observers
            .iter()
            .map(|&observer| {
                AttributedObservation::sign(
                    &PrivateKey::from_seed(observer as u64),
                    observer,
                    &shared.config_digest,
                    &context,
                    &query,
                    Bytes::copy_from_slice(&observer.to_be_bytes()),
                )
            })
            .collect();
        wire::Outcome::Proposal {
            epoch,
            seq_nr: 1,
            round,
            query,
            attributed_observations,
        }
    }

    fn metric(registry: &Arc<Mutex<Registry>>, name: &str) -> Option<u64> {
        let mut buffer = String::new();
        encode(&mut buffer, &registry.lock().unwrap()).unwrap();
        buffer.lines().find_map(|line| {
            let (key, value) = line.split_once(' ')?;
            (key == name).then(|| value.parse().ok()).flatten()
        })
    }

    fn inbound(registry: &Arc<Mutex<Registry>>, status: &str) -> u64 {
        metric(registry, &format!("outcome_inbound_total{{status=\"{status}\"}}")).unwrap_or(0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_commits_first_block() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let shared = shared();
        let mut committee = committee(shared.clone(), fresh(), None).await;
        for receiver in committee.committed.iter_mut() {
            let attestation::Message::Committed {
                seq_nr,
                reports_plus_precursor,
            } = receiver.next().await.unwrap();
            assert_eq!(seq_nr, 1);
            assert_eq!(reports_plus_precursor, Bytes::from(1u64.to_be_bytes().to_vec()));
        }
        committee.cancel.cancel();

        // Every oracle holds the same commit certificate for block 1
        let mut blocks = Vec::new();
        for db in committee.dbs.iter() {
            let txn = db.read_transaction();
            let block = state::read_block(&txn, 1, &shared.limits).unwrap().unwrap();
            assert!(block.verify(
                Phase::Commit,
                &shared.config_digest,
                &shared.oracles,
                shared.quorum()
            ));
            assert_eq!(
                state::state_root(&txn, 1).unwrap(),
                Some(block.block.state_root)
            );
            assert!(CounterPlugin::read_counter(&KeyValueState::new(db)).unwrap() >= 1);
            blocks.push(block.block);
        }
        assert!(blocks.windows(2).all(|pair| pair[0] == pair[1]));

        for events in committee.events.iter_mut() {
            assert_eq!(events.next().await, Some(Event::Persisted(1)));
            assert_eq!(events.next().await, Some(Event::Committed(1)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_commits_continue_across_rounds() {
        let shared = shared();
        let mut committee = committee(shared.clone(), fresh(), None).await;
        for receiver in committee.committed.iter_mut() {
            for expected in 1..=5 {
                let attestation::Message::Committed { seq_nr, .. } = receiver.next().await.unwrap();
                assert_eq!(seq_nr, expected);
            }
        }
        committee.cancel.cancel();
        for db in committee.dbs.iter() {
            let committed = state::read_committed(&db.read_transaction()).unwrap();
            assert!(committed.seq_nr >= 5);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_halts_after_replay_mismatches() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut shared = shared();
        shared.delta_progress = Duration::from_secs(5);
        shared.max_consecutive_replay_mismatches = 2;

        // Every oracle holds a prepare certificate whose state root no replay can reproduce
        let mut modifications = BTreeMap::new();
        modifications.insert(Bytes::from_static(b"counter"), Some(Bytes::from_static(b"x")));
        let block = StateTransitionBlock {
            epoch: 0,
            seq_nr: 1,
            prev_history_digest: Digest::ZERO,
            inputs_digest: Digest::ZERO,
            write_set: WriteSet::new(modifications),
            state_root: hash(b"not the root"),
            reports_plus_precursor: Bytes::new(),
        };
        let dbs = prepared(&shared, block);

        let committee = committee(shared.clone(), dbs, None).await;
        tokio::time::sleep(Duration::from_secs(60)).await;
        committee.cancel.cancel();
        for (registry, db) in committee.registries.iter().zip(committee.dbs.iter()) {
            assert_eq!(metric(registry, "outcome_replay_mismatches_total"), Some(2));
            assert_eq!(state::read_committed(&db.read_transaction()).unwrap().seq_nr, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reproposal_commits_prepared_block() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let shared = shared();

        // Every oracle holds a prepare certificate for a block its replay reproduces
        let mut modifications = BTreeMap::new();
        let counter = Bytes::copy_from_slice(&7u64.to_be_bytes());
        modifications.insert(Bytes::from_static(b"counter"), Some(counter));
        let write_set = WriteSet::new(modifications);
        let empty = Database::new();
        let (state_root, _) =
            state::compute_state_root(&empty.read_transaction(), 1, &write_set).unwrap();
        let block = StateTransitionBlock {
            epoch: 0,
            seq_nr: 1,
            prev_history_digest: Digest::ZERO,
            inputs_digest: hash(b"inputs"),
            write_set,
            state_root,
            reports_plus_precursor: Bytes::from_static(b"prepared"),
        };
        let dbs = prepared(&shared, block.clone());

        let mut committee = committee(shared.clone(), dbs, None).await;
        for receiver in committee.committed.iter_mut() {
            let attestation::Message::Committed {
                seq_nr,
                reports_plus_precursor,
            } = receiver.next().await.unwrap();
            assert_eq!(seq_nr, 1);
            assert_eq!(reports_plus_precursor, block.reports_plus_precursor);
        }

        // Fresh rounds build on the replayed block
        for receiver in committee.committed.iter_mut() {
            let attestation::Message::Committed { seq_nr, .. } = receiver.next().await.unwrap();
            assert_eq!(seq_nr, 2);
        }
        committee.cancel.cancel();
        for (registry, db) in committee.registries.iter().zip(committee.dbs.iter()) {
            let txn = db.read_transaction();
            let committed = state::read_block(&txn, 1, &shared.limits).unwrap().unwrap();
            assert_eq!(committed.block, block);
            assert_eq!(metric(registry, "outcome_replay_mismatches_total"), Some(0));
            assert!(CounterPlugin::read_counter(&KeyValueState::new(db)).unwrap() >= 8);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffers_messages_until_epoch_starts() {
        let shared = shared();
        let mut manual = manual(shared.clone(), 2).await;

        // Sent before anyone entered epoch 1, so only the last two per oracle are kept
        let early = wire::Outcome::RoundStart {
            epoch: 1,
            seq_nr: 1,
            round: 1,
            query: Bytes::new(),
        };
        for _ in 0..3 {
            manual.send(Recipients::All, early.clone()).await;
        }
        manual
            .send(Recipients::All, genesis_epoch_start(&shared, 1))
            .await;
        manual
            .send(Recipients::All, proposal(&shared, 1, 1, &[0, 1, 2]))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        for registry in manual.registries.iter() {
            assert_eq!(inbound(registry, "Buffered"), 5);
            assert_eq!(inbound(registry, "Dropped"), 3);
        }

        // Entering the epoch replays the epoch start and the proposal
        manual.start_epoch(1, MANUAL).await;
        for receiver in manual.committed.iter_mut() {
            let attestation::Message::Committed { seq_nr, .. } = receiver.next().await.unwrap();
            assert_eq!(seq_nr, 1);
        }

        // Messages for an epoch already left are dropped
        manual.start_epoch(2, MANUAL).await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        let dropped = inbound(&manual.registries[0], "Dropped");
        manual.send(Recipients::One(0), early).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(inbound(&manual.registries[0], "Dropped"), dropped + 1);
        assert!(manual.blocked.try_next().is_err());
        manual.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_equivocating_leader_blocks_no_one() {
        let shared = shared();
        let mut manual = manual(shared.clone(), 16).await;
        manual.start_epoch(1, MANUAL).await;
        manual
            .send(Recipients::All, genesis_epoch_start(&shared, 1))
            .await;

        // Oracles 0 and 1 are proposed one block, oracle 2 another
        manual
            .send(
                Recipients::Some(vec![0, 1]),
                proposal(&shared, 1, 1, &[0, 1, 2]),
            )
            .await;
        manual
            .send(Recipients::One(2), proposal(&shared, 1, 1, &[0, 1, MANUAL]))
            .await;
        let mut prepared = BTreeMap::new();
        while prepared.len() < MANUAL as usize {
            if let (peer, wire::Outcome::Prepare { signature, .. }) = manual.recv(&shared).await {
                prepared.insert(peer, signature);
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Prepares over the other block are dropped, not blamed on their signer
        assert!(manual.blocked.try_next().is_err());
        for registry in manual.registries.iter() {
            assert!(inbound(registry, "Dropped") >= 1);
            assert_eq!(inbound(registry, "Invalid"), 0);
        }
        for receiver in manual.committed.iter_mut() {
            assert!(receiver.try_next().is_err());
        }

        // With everyone still talking, an honest leader commits in the next epoch
        manual.start_epoch(2, 0).await;
        for receiver in manual.committed.iter_mut() {
            let attestation::Message::Committed { seq_nr, .. } = receiver.next().await.unwrap();
            assert_eq!(seq_nr, 1);
        }
        assert!(manual.blocked.try_next().is_err());
        manual.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lagging_oracle_learns_it_is_behind() {
        let shared = shared();
        let isolated = (shared.leader(0) + 1) % N;
        let mut committee = committee(shared.clone(), fresh(), Some(isolated)).await;

        // The rest of the committee makes progress without it
        let online = (isolated + 1) % N;
        for _ in 1..=3 {
            committee.committed[online as usize].next().await.unwrap();
        }
        for i in 0..N {
            if i != isolated {
                committee.oracle.add_link(i, isolated, Link::instant()).await.unwrap();
                committee.oracle.add_link(isolated, i, Link::instant()).await.unwrap();
            }
        }

        let events = &mut committee.events[isolated as usize];
        let Some(Event::Behind(seq_nr)) = events.next().await else {
            panic!("expected to fall behind");
        };
        assert!(seq_nr >= 2);
        committee.cancel.cancel();
        assert_eq!(
            state::read_committed(&committee.dbs[isolated as usize].read_transaction())
                .unwrap()
                .seq_nr,
            0
        );
    }
}
