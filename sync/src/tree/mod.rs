//! Download the key-value state at a snapshot when peers no longer hold the blocks to replay.
//!
//! Every `delta_state_sync_summary`, each oracle broadcasts a
//! [StateSyncSummary](crate::wire::Tree::StateSyncSummary) with the lowest block it still holds
//! and the highest sequence number it committed. From the latest summary of every peer, an oracle
//! [decide]s whether it is up to date, should fetch blocks (block-sync), or must download the
//! state (tree-sync).
//!
//! # Tree-sync
//!
//! 1. The target is the latest snapshot (a multiple of `snapshot_interval`) at or below the
//!    committee height. The status moves to [Phase::Waiting] and the attested block at the
//!    target is [fetched](crate::blocks::Mailbox::fetch) from peers.
//! 2. Once the block arrives, its certified state root is the root the downloaded state must
//!    match. Local blocks, values, and tree nodes are wiped, the block is persisted, and the
//!    status moves to [Phase::Active] with the key digest space split into disjoint ranges.
//! 3. Ranges are requested from peers that reported committing the target. Each chunk carries a
//!    [SubrangeProof](ocr_storage::jmt::SubrangeProof) over the leaves it returns; a chunk that
//!    fails verification gets its sender blocked. Peers that no longer hold the snapshot go away
//!    and are skipped for a while; requests that time out are retried elsewhere.
//! 4. Verified leaves are inserted into the tree at the target version and the range is advanced,
//!    in one transaction. Progress survives restarts.
//! 5. When no range is pending, the committed sequence number is set to the target in the same
//!    transaction that clears the status. The held block at the target makes it the lowest (and
//!    highest) persisted block, so block persistence resumes from there.

mod actor;
mod decision;
mod metrics;
mod status;

pub use actor::Actor;
pub use decision::{decide, Decision, Summary};
pub use status::{read_status, write_status, Phase, TreeSyncStatus};

use crate::blocks;
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

/// Configuration for state sync.
pub struct Config<B: Blocker, R: Reporter> {
    pub me: OracleId,
    pub shared: SharedConfig,
    pub db: Database,
    pub blocker: B,

    /// Block persistence, used to fetch the block at the target and to block-sync.
    pub blocks: blocks::Mailbox,

    /// Told when tree-sync completes.
    pub reporter: R,

    /// Chunk requests per peer.
    pub rate_limit: Quota,

    /// How long to wait for a chunk before asking another peer.
    pub fetch_timeout: Duration,

    /// Number of ranges the key digest space is split into.
    pub ranges: usize,

    /// Chunk requests in flight at once.
    pub max_outstanding: usize,

    pub registry: Arc<Mutex<Registry>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{self, Chunk, Limits};
    use bytes::Bytes;
    use futures::{channel::mpsc, StreamExt};
    use ocr_codec::{Decode, Encode};
    use ocr_consensus::{mocks::certified_chain, state, types::WriteSet};
    use ocr_cryptography::{Digest, PrivateKey};
    use ocr_p2p::{
        simulated::{self, Link, Network},
        Receiver as _, Recipients, Sender as _,
    };
    use ocr_storage::{
        jmt::{self, JellyfishMerkleTree, LeafNode},
        kv::Transaction,
    };
    use ocr_utils::{ConfigDigest, SeqNr};
    use std::{collections::BTreeMap, num::NonZeroU32};
    use tokio_util::sync::CancellationToken;

    const N: u32 = 4;
    const BLOCKS: u32 = 0;
    const TREE: u32 = 1;

    fn shared() -> SharedConfig {
        let oracles = (0..N as u64)
            .map(|i| PrivateKey::from_seed(i).public_key())
            .collect();
        let mut shared = SharedConfig::new(ConfigDigest([7u8; 32]), oracles, 1);
        shared.max_tree_sync_chunk_keys = 8;
        shared
    }

    fn write_set(seq_nr: SeqNr) -> WriteSet {
        let value = Bytes::copy_from_slice(&seq_nr.to_be_bytes());
        let mut entries = BTreeMap::new();
        entries.insert(Bytes::from_static(b"counter"), Some(value.clone()));
        entries.insert(Bytes::from(format!("k{}", seq_nr % 50)), Some(value));
        WriteSet::new(entries)
    }

    /// Peers that committed 1000 blocks and pruned those below 500.
    fn pruned_source() -> Database {
        let signers: Vec<_> = (0..N as u64).map(PrivateKey::from_seed).collect();
        let db = Database::new();
        certified_chain(&db, &shared().config_digest, &signers, 1000, write_set).unwrap();
        let mut txn = db.unserialized_transaction();
        state::prune_blocks(&mut txn, 500).unwrap();
        txn.commit().unwrap();
        db
    }

    #[derive(Clone)]
    struct Commits(mpsc::UnboundedSender<SeqNr>);

    impl Reporter for Commits {
        async fn persisted(&mut self, _: SeqNr) {}

        async fn behind(&mut self, _: SeqNr) {}

        async fn committed(&mut self, seq_nr: SeqNr) {
            let _ = self.0.unbounded_send(seq_nr);
        }
    }

    /// Records every peer blocked.
    #[derive(Clone)]
    struct Blocked(mpsc::UnboundedSender<OracleId>);

    impl Blocker for Blocked {
        async fn block(&mut self, peer: OracleId) {
            let _ = self.0.unbounded_send(peer);
        }
    }

    /// Start block persistence and state sync for `me`.
    async fn spawn_oracle<B: Blocker>(
        oracle: &mut simulated::Oracle,
        me: OracleId,
        db: Database,
        blocker: B,
        reporter: Commits,
        cancel: &CancellationToken,
    ) {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let rate_limit = Quota::per_second(NonZeroU32::new(100).unwrap());
        let (block_persistence, mailbox) = blocks::Actor::new(blocks::Config {
            me,
            shared: shared(),
            db: db.clone(),
            blocker: blocker.clone(),
            reporter: reporter.clone(),
            rate_limit,
            fetch_timeout: Duration::from_secs(2),
            mailbox_size: 16,
            registry: registry.clone(),
        });
        let channels = oracle.register(me, BLOCKS, 1 << 20).await.unwrap();
        block_persistence.start(channels, cancel.clone());
        let tree = Actor::new(Config {
            me,
            shared: shared(),
            db,
            blocker,
            blocks: mailbox,
            reporter,
            rate_limit,
            fetch_timeout: Duration::from_secs(2),
            ranges: 4,
            max_outstanding: 4,
            registry,
        });
        tree.start(oracle.register(me, TREE, 1 << 20).await.unwrap(), cancel.clone());
    }

    async fn link_all(oracle: &mut simulated::Oracle) {
        for i in 0..N {
            for j in 0..N {
                if i != j {
                    oracle.add_link(i, j, Link::instant()).await.unwrap();
                }
            }
        }
    }

    /// Ask oracle 1 for the whole key space at `seq_nr`, skipping its summaries.
    async fn request_chunk(
        sender: &mut simulated::Sender,
        receiver: &mut simulated::Receiver,
        limits: &Limits,
        seq_nr: SeqNr,
    ) -> Option<Chunk> {
        let request = wire::Tree::TreeSyncChunkRequest {
            seq_nr,
            start: Digest::ZERO,
            end: Digest::MAX,
        };
        sender
            .send(Recipients::One(1), request.encode().freeze(), false)
            .await
            .unwrap();
        loop {
            let (_, raw) = receiver.recv().await.unwrap();
            if let wire::Tree::TreeSyncChunkResponse {
                seq_nr: responded,
                chunk,
                ..
            } = wire::Tree::decode_cfg(raw, limits).unwrap()
            {
                assert_eq!(responded, seq_nr);
                return chunk;
            }
        }
    }

    async fn wait_for_commit(committed: &mut mpsc::UnboundedReceiver<SeqNr>, target: SeqNr) {
        while committed.next().await.unwrap() < target {}
    }

    /// The local state must equal the source state at the target.
    fn assert_synced(local: &Database, source: &Database, target: SeqNr) {
        let (txn, expected) = (local.read_transaction(), source.read_transaction());
        assert_eq!(
            state::read_committed(&txn).unwrap(),
            state::read_committed(&expected).unwrap()
        );
        assert_eq!(
            state::state_root(&txn, target).unwrap(),
            state::state_root(&expected, target).unwrap()
        );
        for key in (0..50).map(|i| format!("k{i}")).chain(["counter".to_string()]) {
            assert_eq!(
                state::read_value(&txn, key.as_bytes()).unwrap(),
                state::read_value(&expected, key.as_bytes()).unwrap()
            );
        }
        assert_eq!(state::persisted_range(&txn).unwrap(), Some((target, target)));
        assert_eq!(read_status(&txn).unwrap(), TreeSyncStatus::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_replica_tree_syncs() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let (commits, mut committed) = mpsc::unbounded();

        let source = pruned_source();
        let local = Database::new();
        for i in 0..N {
            let db = if i == 0 { local.clone() } else { source.clone() };
            let blocker = oracle.control(i);
            spawn_oracle(&mut oracle, i, db, blocker, Commits(commits.clone()), &cancel).await;
        }
        link_all(&mut oracle).await;

        wait_for_commit(&mut committed, 1000).await;
        assert_synced(&local, &source, 1000);
        cancel.cancel();
    }

    /// Sync oracle 0 from oracles 2 and up while oracle 1 answers every chunk request with
    /// `forge`, then check oracle 1 was blocked and the sync still completed.
    async fn sync_past_forger<F>(forge: F)
    where
        F: Fn(&JellyfishMerkleTree<'_, Transaction>, SeqNr, Digest, Digest) -> Chunk
            + Send
            + 'static,
    {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let (commits, mut committed) = mpsc::unbounded();
        let (blocked, mut blocked_peers) = mpsc::unbounded();

        let source = pruned_source();
        let local = Database::new();
        spawn_oracle(
            &mut oracle,
            0,
            local.clone(),
            Blocked(blocked),
            Commits(commits.clone()),
            &cancel,
        )
        .await;
        for i in 2..N {
            let blocker = oracle.control(i);
            spawn_oracle(&mut oracle, i, source.clone(), blocker, Commits(commits.clone()), &cancel)
                .await;
        }
        let (_, mut ignored) = oracle.register(1, BLOCKS, 1 << 20).await.unwrap();
        tokio::spawn(async move { while ignored.recv().await.is_ok() {} });
        let (mut sender, mut receiver) = oracle.register(1, TREE, 1 << 20).await.unwrap();
        link_all(&mut oracle).await;

        // Oracle 1 claims the snapshot
        let summary = wire::Tree::StateSyncSummary {
            lowest_persisted_seq_nr: 500,
            highest_committed_seq_nr: 1000,
        };
        sender
            .send(Recipients::One(0), summary.encode().freeze(), true)
            .await
            .unwrap();
        let limits = Limits::new(&shared());
        let forger = source.clone();
        tokio::spawn(async move {
            while let Ok((peer, raw)) = receiver.recv().await {
                let Ok(wire::Tree::TreeSyncChunkRequest { seq_nr, start, end }) =
                    wire::Tree::decode_cfg(raw, &limits)
                else {
                    continue;
                };
                let chunk = {
                    let txn = forger.read_transaction();
                    forge(&JellyfishMerkleTree::new(&txn), seq_nr, start, end)
                };
                let response = wire::Tree::TreeSyncChunkResponse {
                    seq_nr,
                    start,
                    chunk: Some(chunk),
                };
                let _ = sender
                    .send(Recipients::One(peer), response.encode().freeze(), false)
                    .await;
            }
        });

        wait_for_commit(&mut committed, 1000).await;
        assert_eq!(blocked_peers.next().await, Some(1));
        assert_synced(&local, &source, 1000);
        cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_forged_chunk_blocks_sender() {
        sync_past_forger(|tree, seq_nr, start, end| {
            // Leave room for the forged leaf so the chunk still decodes
            let range = tree.get_range(seq_nr, &start, &end, 7, 1 << 20).unwrap();
            let proof = tree.prove_subrange(seq_nr, &start, &range.last).unwrap();
            let mut leaves = range.leaves;
            leaves.push(LeafNode::new(
                Bytes::from_static(b"forged"),
                Bytes::from_static(b"value"),
            ));
            Chunk {
                leaves,
                last: range.last,
                proof,
            }
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_truncated_chunk_blocks_sender() {
        // Proves that no leaf sits exactly at `start`, claiming progress without any leaves
        sync_past_forger(|tree, seq_nr, start, _| Chunk {
            leaves: Vec::new(),
            last: start,
            proof: tree.prove_subrange(seq_nr, &start, &start).unwrap(),
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_serves_verifiable_chunks() {
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let (commits, _) = mpsc::unbounded();

        let source = pruned_source();
        let blocker = oracle.control(1);
        spawn_oracle(&mut oracle, 1, source.clone(), blocker, Commits(commits), &cancel).await;
        let (mut sender, mut receiver) = oracle.register(0, TREE, 1 << 20).await.unwrap();
        oracle.add_link(0, 1, Link::instant()).await.unwrap();
        oracle.add_link(1, 0, Link::instant()).await.unwrap();

        let limits = Limits::new(&shared());
        let root = state::state_root(&source.read_transaction(), 1000)
            .unwrap()
            .unwrap();
        // The whole key space does not fit, so the chunk is truncated and proven up to its end
        let chunk = request_chunk(&mut sender, &mut receiver, &limits, 1000)
            .await
            .expect("snapshot is held");
        assert_eq!(chunk.leaves.len(), 8);
        assert!(chunk.last < Digest::MAX);
        jmt::verify_subrange(&root, &Digest::ZERO, &chunk.last, &chunk.leaves, &chunk.proof)
            .unwrap();

        // A snapshot never reached is gone
        assert!(request_chunk(&mut sender, &mut receiver, &limits, 2000)
            .await
            .is_none());
        cancel.cancel();
    }
}
