//! Move the committee to a new epoch, and thus a new leader, when progress stalls.
//!
//! # Design
//!
//! Each oracle tracks the epoch it is in and the highest epoch it has asked for (its "wish").
//! If no block is committed within `delta_progress`, or outcome generation asks for a new
//! leader, the oracle wishes for the next epoch and broadcasts `NewEpochWish` every
//! `delta_resend` until the epoch changes.
//!
//! Wishes are amplified: once `f + 1` oracles wish for some epoch beyond this oracle's own wish,
//! at least one honest oracle wants it too, so this oracle adopts it. Once byz-quorum-many
//! oracles wish for an epoch beyond the current one, the oracle enters it and tells outcome
//! generation who leads it (see [SharedConfig::leader](crate::SharedConfig::leader)).
//!
//! Both epochs are persisted before acting on them so a restarted oracle never moves backwards.

mod actor;
mod ingress;
mod metrics;

pub use actor::Actor;
pub use ingress::{Mailbox, Message};

use crate::SharedConfig;
use ocr_storage::kv::Database;
use ocr_utils::OracleId;
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex};

/// Configuration for the pacemaker [Actor].
pub struct Config {
    pub me: OracleId,
    pub shared: SharedConfig,
    pub db: Database,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    pub registry: Arc<Mutex<Registry>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{outcome, state};
    use futures::{channel::mpsc, StreamExt};
    use ocr_cryptography::PrivateKey;
    use ocr_p2p::simulated::{self, Link, Network};
    use ocr_utils::{ConfigDigest, Epoch};
    use bytes::Bytes;
    use std::{
        sync::atomic::{AtomicBool, Ordering},
        thread,
        time::Duration,
    };
    use tokio_util::sync::CancellationToken;

    const N: u32 = 4;
    const F: u32 = 1;

    fn shared() -> SharedConfig {
        let oracles = (0..N as u64)
            .map(|i| PrivateKey::from_seed(i).public_key())
            .collect();
        let mut shared = SharedConfig::new(ConfigDigest([9u8; 32]), oracles, F);
        shared.delta_progress = Duration::from_secs(10);
        shared.delta_resend = Duration::from_secs(1);
        shared
    }

    struct Committee {
        mailboxes: Vec<Mailbox>,
        epochs: Vec<mpsc::Receiver<outcome::Message>>,
        cancel: CancellationToken,
    }

    async fn committee(shared: SharedConfig, dbs: Vec<Database>) -> Committee {
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let mut mailboxes = Vec::new();
        let mut epochs = Vec::new();
        for (i, db) in (0..N).zip(dbs) {
            let channels = oracle.register(i, 0, 1024).await.unwrap();
            let (actor, mailbox) = Actor::new(Config {
                me: i,
                shared: shared.clone(),
                db,
                mailbox_size: 16,
                registry: Arc::new(Mutex::new(Registry::default())),
            })
            .unwrap();
            let (sender, receiver) = mpsc::channel(16);
            actor.start(outcome::Mailbox::new(sender), channels, cancel.clone());
            mailboxes.push(mailbox);
            epochs.push(receiver);
        }
        for i in 0..N {
            for j in 0..N {
                if i != j {
                    oracle.add_link(i, j, Link::instant()).await.unwrap();
                }
            }
        }
        Committee {
            mailboxes,
            epochs,
            cancel,
        }
    }

    fn fresh() -> Vec<Database> {
        (0..N).map(|_| Database::new()).collect()
    }

    async fn next_epoch(receiver: &mut mpsc::Receiver<outcome::Message>) -> Epoch {
        let outcome::Message::StartEpoch { epoch, leader } = receiver.next().await.unwrap();
        assert_eq!(leader, shared().leader(epoch));
        epoch
    }

    #[tokio::test(start_paused = true)]
    async fn test_starts_persisted_epoch() {
        let mut committee = committee(shared(), fresh()).await;
        for receiver in committee.epochs.iter_mut() {
            assert_eq!(next_epoch(receiver).await, 0);
        }
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_moves_every_oracle() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut committee = committee(shared(), fresh()).await;
        for receiver in committee.epochs.iter_mut() {
            assert_eq!(next_epoch(receiver).await, 0);
        }
        tokio::time::sleep(Duration::from_secs(11)).await;
        for receiver in committee.epochs.iter_mut() {
            assert_eq!(next_epoch(receiver).await, 1);
        }
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_defers_timeout() {
        let mut committee = committee(shared(), fresh()).await;
        for receiver in committee.epochs.iter_mut() {
            assert_eq!(next_epoch(receiver).await, 0);
        }
        for _ in 0..5 {
            tokio::time::sleep(Duration::from_secs(5)).await;
            for mailbox in committee.mailboxes.iter_mut() {
                mailbox.progress().await;
            }
        }
        for receiver in committee.epochs.iter_mut() {
            assert!(receiver.try_next().is_err());
        }
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_wish_is_not_enough() {
        let mut committee = committee(shared(), fresh()).await;
        for receiver in committee.epochs.iter_mut() {
            assert_eq!(next_epoch(receiver).await, 0);
        }
        committee.mailboxes[0].change_leader().await;
        tokio::time::sleep(Duration::from_secs(3)).await;
        for receiver in committee.epochs.iter_mut() {
            assert!(receiver.try_next().is_err());
        }

        // A second wish is amplified by the remaining oracles
        committee.mailboxes[1].change_leader().await;
        tokio::time::sleep(Duration::from_secs(1)).await;
        for receiver in committee.epochs.iter_mut() {
            assert_eq!(next_epoch(receiver).await, 1);
        }
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_epoch() {
        let dbs = fresh();
        for db in dbs.iter() {
            let mut txn = db.serialized_transaction();
            state::write_pacemaker_state(
                &mut txn,
                &state::PacemakerState {
                    epoch: 5,
                    highest_sent_new_epoch_wish: 5,
                },
            )
            .unwrap();
            txn.commit().unwrap();
        }
        let mut committee = committee(shared(), dbs.clone()).await;
        for receiver in committee.epochs.iter_mut() {
            assert_eq!(next_epoch(receiver).await, 5);
        }
        tokio::time::sleep(Duration::from_secs(11)).await;
        for receiver in committee.epochs.iter_mut() {
            assert_eq!(next_epoch(receiver).await, 6);
        }
        committee.cancel.cancel();

        let persisted = state::read_pacemaker_state(&dbs[2].read_transaction()).unwrap();
        assert_eq!(persisted.epoch, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_epochs_change_while_others_write() {
        let dbs = fresh();

        // Other components keep committing to the same databases
        let stop = Arc::new(AtomicBool::new(false));
        let writers: Vec<_> = dbs
            .iter()
            .cloned()
            .map(|db| {
                let stop = stop.clone();
                thread::spawn(move || {
                    let mut count = 0u64;
                    while !stop.load(Ordering::Relaxed) {
                        let mut txn = db.unserialized_transaction();
                        txn.put(b"other".to_vec(), Bytes::copy_from_slice(&count.to_be_bytes()))
                            .unwrap();
                        txn.commit().unwrap();
                        count += 1;
                        thread::sleep(Duration::from_micros(50));
                    }
                })
            })
            .collect();

        let mut committee = committee(shared(), dbs.clone()).await;
        let changes = async {
            for receiver in committee.epochs.iter_mut() {
                assert_eq!(next_epoch(receiver).await, 0);
            }
            for expected in 1..=20 {
                committee.mailboxes[0].change_leader().await;
                committee.mailboxes[1].change_leader().await;
                for receiver in committee.epochs.iter_mut() {
                    assert_eq!(next_epoch(receiver).await, expected);
                }
            }
        };
        tokio::time::timeout(Duration::from_secs(60), changes)
            .await
            .expect("pacemakers stopped changing epochs");
        committee.cancel.cancel();
        stop.store(true, Ordering::Relaxed);
        for writer in writers {
            writer.join().unwrap();
        }

        for db in dbs.iter() {
            let persisted = state::read_pacemaker_state(&db.read_transaction()).unwrap();
            assert_eq!(persisted.epoch, 20);
        }
    }
}
