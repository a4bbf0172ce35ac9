//! Sign the reports of each committed block and gather a quorum of signatures per report.
//!
//! Once a block is committed, the local [Plugin](crate::Plugin) expands its
//! reports-plus-precursor into reports. Each oracle signs every report (binding the config
//! digest, sequence number, and report index) and broadcasts all of its signatures for the
//! block in one `ReportSignatures` message. Signatures that arrive before the local expansion
//! finishes are held and verified later.
//!
//! A report with byz-quorum-many valid signatures becomes an
//! [AttestedReport](crate::types::AttestedReport) and is handed to transmission exactly once.
//! Only the last `window` committed blocks are tracked.

mod actor;
mod ingress;
mod metrics;

pub use actor::Actor;
pub use ingress::{Mailbox, Message};

use crate::{Plugin, SharedConfig};
use ocr_cryptography::PrivateKey;
use ocr_p2p::Blocker;
use ocr_utils::OracleId;
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex};

/// Configuration for report attestation.
pub struct Config<P: Plugin, B: Blocker> {
    pub me: OracleId,
    pub signer: PrivateKey,
    pub shared: SharedConfig,
    pub plugin: P,
    pub blocker: B,

    /// Committed blocks, counting back from the highest, whose signatures are still gathered.
    pub window: u64,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    pub registry: Arc<Mutex<Registry>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mocks::CounterPlugin, transmission, wire};
    use bytes::Bytes;
    use futures::{channel::mpsc, StreamExt};
    use ocr_codec::Encode;
    use ocr_p2p::{
        simulated::{self, Link, Network},
        Recipients, Sender as _,
    };
    use ocr_utils::ConfigDigest;
    use tokio_util::sync::CancellationToken;

    const N: u32 = 4;
    const F: u32 = 1;

    fn shared() -> SharedConfig {
        let oracles = (0..N as u64)
            .map(|i| PrivateKey::from_seed(i).public_key())
            .collect();
        SharedConfig::new(ConfigDigest([5u8; 32]), oracles, F)
    }

    struct Setup {
        oracle: simulated::Oracle,
        mailboxes: Vec<Mailbox>,
        attested: Vec<mpsc::Receiver<transmission::Message>>,
        cancel: CancellationToken,
    }

    /// Run attestation on the first `honest` oracles of the committee.
    async fn setup(honest: u32) -> Setup {
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();
        let mut mailboxes = Vec::new();
        let mut attested = Vec::new();
        for i in 0..honest {
            let (actor, mailbox) = Actor::new(Config {
                me: i,
                signer: PrivateKey::from_seed(i as u64),
                shared: shared(),
                plugin: CounterPlugin::new(i, N, F),
                blocker: oracle.control(i),
                window: 10,
                mailbox_size: 16,
                registry: Arc::new(Mutex::new(Registry::default())),
            });
            let (sender, receiver) = mpsc::channel(16);
            let channels = oracle.register(i, 0, 1 << 16).await.unwrap();
            actor.start(transmission::Mailbox::new(sender), channels, cancel.clone());
            mailboxes.push(mailbox);
            attested.push(receiver);
        }
        Setup {
            oracle,
            mailboxes,
            attested,
            cancel,
        }
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

    #[tokio::test(start_paused = true)]
    async fn test_reports_attested_once() {
        let mut setup = setup(N).await;
        link_all(&mut setup.oracle).await;
        let precursor = Bytes::from_static(b"precursor");
        for mailbox in setup.mailboxes.iter_mut() {
            mailbox.committed(1, precursor.clone()).await;
            // Repeats are ignored
            mailbox.committed(1, precursor.clone()).await;
        }

        let shared = shared();
        for receiver in setup.attested.iter_mut() {
            let transmission::Message::Attested(report) = receiver.next().await.unwrap();
            assert_eq!(report.seq_nr, 1);
            assert_eq!(report.index, 0);
            assert_eq!(report.report.report, precursor);
            assert!(report.verify(&shared.config_digest, &shared.oracles, shared.quorum()));
            assert!(report.signatures.windows(2).all(|pair| pair[0].0 < pair[1].0));
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        for receiver in setup.attested.iter_mut() {
            assert!(receiver.try_next().is_err());
        }
        setup.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_signatures_ignored() {
        let mut setup = setup(N - 1).await;
        let (mut byzantine, _) = setup.oracle.register(N - 1, 0, 1 << 16).await.unwrap();
        link_all(&mut setup.oracle).await;

        // Signed by the right key, but over a different report
        let signer = PrivateKey::from_seed((N - 1) as u64);
        let forged = crate::types::ReportWithInfo {
            report: Bytes::from_static(b"forged"),
            info: Bytes::new(),
        };
        let msg = wire::Attestation::ReportSignatures {
            seq_nr: 1,
            signatures: vec![forged.sign(&signer, &shared().config_digest, 1, 0)],
        };
        byzantine
            .send(Recipients::All, msg.encode().freeze(), true)
            .await
            .unwrap();

        for mailbox in setup.mailboxes.iter_mut() {
            mailbox.committed(1, Bytes::from_static(b"honest")).await;
        }
        for receiver in setup.attested.iter_mut() {
            let transmission::Message::Attested(report) = receiver.next().await.unwrap();
            let signers: Vec<_> = report.signatures.iter().map(|(signer, _)| *signer).collect();
            assert_eq!(signers, vec![0, 1, 2]);
        }
        setup.cancel.cancel();
    }
}
