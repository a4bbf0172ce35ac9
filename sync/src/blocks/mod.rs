//! Persist attested blocks, replay them into the key-value state, and fetch missing ones.
//!
//! Outcome generation persists every block it sees certified, but only applies the one that
//! directly follows the committed state. When it learns that the committee committed a block it
//! cannot persist gap-free, it reports the oracle as [behind](ocr_consensus::Reporter::behind).
//! Block persistence then:
//!
//! - requests the missing range from peers, at most `max_blocks_per_response` blocks at a time,
//!   using the [Requester](ocr_p2p::utils::requester::Requester) to prefer fast peers and skip
//!   those that time out or have pruned the blocks (a go-away).
//! - verifies the commit certificate of every block it receives and blocks peers that send
//!   invalid ones.
//! - persists blocks gap-free and [replay]s them strictly in order, checking each state root.
//!
//! It also serves the same requests for other oracles and, on behalf of tree-sync,
//! [fetches](Mailbox::fetch) the attested block at a snapshot.

mod actor;
mod ingress;
mod metrics;
mod replay;

pub use actor::Actor;
pub use ingress::{Mailbox, Message};
pub use replay::replay;

use governor::Quota;
use ocr_consensus::{Reporter, SharedConfig};
use ocr_p2p::Blocker;
use ocr_storage::kv::Database;
use ocr_utils::OracleId;
use prometheus_client::registry::Registry;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Configuration for block persistence.
pub struct Config<B: Blocker, R: Reporter> {
    pub me: OracleId,
    pub shared: SharedConfig,
    pub db: Database,
    pub blocker: B,

    /// Told when replay advances the committed state.
    pub reporter: R,

    /// Block-sync requests per peer.
    pub rate_limit: Quota,

    /// How long to wait for a response before asking another peer. Peers that go away are
    /// skipped for as long.
    pub fetch_timeout: Duration,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    pub registry: Arc<Mutex<Registry>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::{channel::mpsc, StreamExt};
    use ocr_consensus::{mocks::certified_chain, state, types::WriteSet};
    use ocr_cryptography::PrivateKey;
    use ocr_p2p::{
        simulated::{self, Link, Network},
        Receiver as _, Recipients, Sender as _,
    };
    use ocr_codec::{Decode, Encode};
    use ocr_utils::{ConfigDigest, SeqNr};
    use std::{collections::BTreeMap, num::NonZeroU32};
    use tokio_util::sync::CancellationToken;

    const N: u32 = 4;

    fn shared() -> SharedConfig {
        let oracles = (0..N as u64)
            .map(|i| PrivateKey::from_seed(i).public_key())
            .collect();
        let mut shared = SharedConfig::new(ConfigDigest([4u8; 32]), oracles, 1);
        shared.max_blocks_per_response = 3;
        shared
    }

    fn write_set(seq_nr: SeqNr) -> WriteSet {
        let mut entries = BTreeMap::new();
        entries.insert(
            Bytes::from_static(b"last"),
            Some(Bytes::copy_from_slice(&seq_nr.to_be_bytes())),
        );
        WriteSet::new(entries)
    }

    /// Records commits reported by replay.
    #[derive(Clone)]
    struct Commits(mpsc::UnboundedSender<SeqNr>);

    impl Reporter for Commits {
        async fn persisted(&mut self, _: SeqNr) {}

        async fn behind(&mut self, _: SeqNr) {}

        async fn committed(&mut self, seq_nr: SeqNr) {
            let _ = self.0.unbounded_send(seq_nr);
        }
    }

    fn config(
        me: OracleId,
        db: Database,
        blocker: simulated::Control,
        reporter: Commits,
    ) -> Config<simulated::Control, Commits> {
        Config {
            me,
            shared: shared(),
            db,
            blocker,
            reporter,
            rate_limit: Quota::per_second(NonZeroU32::new(100).unwrap()),
            fetch_timeout: Duration::from_secs(2),
            mailbox_size: 16,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// A database that committed `length` blocks and kept those from `lowest` on.
    fn committed_store(length: SeqNr, lowest: SeqNr) -> Database {
        let signers: Vec<_> = (0..N as u64).map(PrivateKey::from_seed).collect();
        let db = Database::new();
        certified_chain(&db, &shared().config_digest, &signers, length, write_set).unwrap();
        let mut txn = db.unserialized_transaction();
        state::prune_blocks(&mut txn, lowest).unwrap();
        txn.commit().unwrap();
        db
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_sync_catches_up() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let (commits, mut committed) = mpsc::unbounded();

        // Peers share one store that committed 8 blocks
        let source = committed_store(8, 1);
        let mut mailboxes = Vec::new();
        for i in 0..N {
            let db = if i == 0 { Database::new() } else { source.clone() };
            let reporter = Commits(commits.clone());
            let (actor, mailbox) = Actor::new(config(i, db, oracle.control(i), reporter));
            let channels = oracle.register(i, 0, 1 << 20).await.unwrap();
            actor.start(channels, cancel.clone());
            mailboxes.push(mailbox);
        }
        for i in 0..N {
            for j in 0..N {
                if i != j {
                    oracle.add_link(i, j, Link::instant()).await.unwrap();
                }
            }
        }

        mailboxes[0].behind(8).await;
        let mut highest = 0;
        while highest < 8 {
            highest = committed.next().await.unwrap();
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruned_blocks_go_away() {
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let (commits, _) = mpsc::unbounded();

        let (actor, _) = Actor::new(config(
            1,
            committed_store(6, 5),
            oracle.control(1),
            Commits(commits),
        ));
        let channels = oracle.register(1, 0, 1 << 20).await.unwrap();
        actor.start(channels, cancel.clone());
        let (mut sender, mut receiver) = oracle.register(0, 0, 1 << 20).await.unwrap();
        oracle.add_link(0, 1, Link::instant()).await.unwrap();
        oracle.add_link(1, 0, Link::instant()).await.unwrap();

        let limits = crate::wire::Limits::new(&shared());
        for (from, expected) in [(2, None), (5, Some(vec![5, 6])), (7, None)] {
            let request = crate::wire::Blocks::BlockSyncRequest { from, to: 20 };
            sender
                .send(Recipients::One(1), request.encode().freeze(), false)
                .await
                .unwrap();
            let (peer, raw) = receiver.recv().await.unwrap();
            assert_eq!(peer, 1);
            let crate::wire::Blocks::BlockSyncResponse { from: echoed, blocks } =
                crate::wire::Blocks::decode_cfg(raw, &limits).unwrap()
            else {
                panic!("expected a response");
            };
            assert_eq!(echoed, from);
            let seq_nrs: Option<Vec<SeqNr>> =
                blocks.map(|blocks| blocks.iter().map(|b| b.block.seq_nr).collect());
            assert_eq!(seq_nrs, expected);
        }
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_skips_peers_without_block() {
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let (commits, _) = mpsc::unbounded();

        // Oracle 1 pruned everything but the last block, oracle 2 holds nothing
        let local = Database::new();
        let stores = [
            local.clone(),
            committed_store(10, 10),
            Database::new(),
            committed_store(10, 4),
        ];
        let mut mailboxes = Vec::new();
        for (i, db) in stores.into_iter().enumerate() {
            let i = i as OracleId;
            let reporter = Commits(commits.clone());
            let (actor, mailbox) = Actor::new(config(i, db, oracle.control(i), reporter));
            let channels = oracle.register(i, 0, 1 << 20).await.unwrap();
            actor.start(channels, cancel.clone());
            mailboxes.push(mailbox);
        }
        for i in 0..N {
            for j in 0..N {
                if i != j {
                    oracle.add_link(i, j, Link::instant()).await.unwrap();
                }
            }
        }

        let block = mailboxes[0].fetch(5).await.unwrap();
        assert_eq!(block.block.seq_nr, 5);
        let shared = shared();
        assert!(block.verify(
            ocr_consensus::types::Phase::Commit,
            &shared.config_digest,
            &shared.oracles,
            shared.quorum()
        ));

        // Fetching does not persist
        let txn = local.read_transaction();
        assert!(state::read_block(&txn, 5, &shared.limits).unwrap().is_none());
        cancel.cancel();
    }
}
