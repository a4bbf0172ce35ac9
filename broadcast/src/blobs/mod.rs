//! Chunked blob dissemination with availability certificates.
//!
//! # Design
//!
//! A submitter splits a payload into fixed-size chunks, persists them, and sends an `Offer`
//! carrying the [BlobMetadata] (including every chunk digest) to the committee. Each oracle that
//! accepts the offer fetches the chunks it is missing from known holders using a rate-limited
//! requester, verifies each chunk against its digest, and once it holds every chunk replies to
//! the submitter with a signed `Available` attestation. When byz-quorum-many attestations
//! (including its own) are collected, the submitter returns a [LightCertifiedBlob].
//!
//! Fetching a blob from a certificate treats every signer as a holder. Because a byz-quorum
//! always contains at least one honest oracle, the payload can always be reconstructed.
//!
//! Holders that respond with a chunk that does not match its digest are blocked. Holders that
//! reply that they do not have a chunk are no longer asked for that blob.
//!
//! Blobs are reaped once their expiry sequence number is committed. Pending broadcasts and
//! fetches for reaped blobs resolve with [Error::Expired](crate::Error::Expired).
//!
//! # Persistence
//!
//! Metadata and chunks are written to the oracle's key-value store, so a restarted engine can
//! keep serving (and keep fetching) blobs it learned about before the restart.

mod config;
pub use config::{Config, DEFAULT_CHUNK_SIZE};
mod engine;
pub use engine::Engine;
mod ingress;
pub use ingress::Mailbox;
mod metrics;
mod store;
pub mod types;
pub use types::{BlobDigest, BlobMetadata, LightCertifiedBlob};
pub mod wire;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BlobBroadcaster, BlobFetcher, Error};
    use bytes::Bytes;
    use governor::Quota;
    use ocr_cryptography::{PrivateKey, PublicKey};
    use ocr_p2p::simulated::{self, Link, Network, Oracle};
    use ocr_storage::kv::Database;
    use ocr_utils::{ConfigDigest, OracleId};
    use prometheus_client::registry::Registry;
    use std::{
        num::NonZeroU32,
        sync::{Arc, Mutex},
        time::Duration,
    };
    use tokio_util::sync::CancellationToken;

    const N: u32 = 4;
    const F: u32 = 1;
    const CHUNK_SIZE: usize = 4;
    const MAX_BLOB_SIZE: usize = 64;
    const CHANNEL: u32 = 0;
    const CONFIG_DIGEST: ConfigDigest = ConfigDigest([7u8; 32]);

    fn participants() -> Vec<PublicKey> {
        (0..N)
            .map(|i| PrivateKey::from_seed(i as u64).public_key())
            .collect()
    }

    fn config(me: OracleId, oracle: &Oracle, db: Database) -> Config<simulated::Control> {
        Config {
            me,
            signer: PrivateKey::from_seed(me as u64),
            participants: participants(),
            f: F,
            config_digest: CONFIG_DIGEST,
            blocker: oracle.control(me),
            db,
            chunk_size: CHUNK_SIZE,
            max_blob_size: MAX_BLOB_SIZE,
            offer_resend: Duration::from_millis(500),
            fetch_timeout: Duration::from_millis(200),
            rate_limit: Quota::per_second(NonZeroU32::new(10_000).unwrap()),
            max_outstanding: 2,
            mailbox_size: 64,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    struct Committee {
        oracle: Oracle,
        mailboxes: Vec<Mailbox>,
        dbs: Vec<Database>,
        cancel: CancellationToken,
    }

    async fn committee() -> Committee {
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let cancel = CancellationToken::new();

        let mut mailboxes = Vec::new();
        let mut dbs = Vec::new();
        for i in 0..N {
            let db = Database::new();
            let channels = oracle.register(i, CHANNEL, 1024).await.unwrap();
            let (engine, mailbox) = Engine::new(config(i, &oracle, db.clone())).unwrap();
            engine.start(channels, cancel.clone());
            mailboxes.push(mailbox);
            dbs.push(db);
        }
        for i in 0..N {
            for j in 0..N {
                if i != j {
                    oracle.add_link(i, j, Link::instant()).await.unwrap();
                }
            }
        }
        Committee {
            oracle,
            mailboxes,
            dbs,
            cancel,
        }
    }

    fn quorum() -> usize {
        ocr_utils::byzantine_quorum(N, F) as usize
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_and_fetch() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let committee = committee().await;
        let payload = Bytes::from_static(b"a payload spanning several chunks");

        let certificate = committee.mailboxes[0]
            .broadcast_blob(payload.clone(), 10)
            .await
            .unwrap();
        assert!(certificate.verify(&CONFIG_DIGEST, &participants(), quorum()));
        assert_eq!(certificate.metadata.submitter, 0);
        assert_eq!(
            certificate.metadata.chunk_digests.len(),
            payload.len().div_ceil(CHUNK_SIZE)
        );

        for mailbox in committee.mailboxes.iter() {
            let fetched = mailbox.fetch_blob(certificate.clone()).await.unwrap();
            assert_eq!(fetched, payload);
        }
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_without_offer() {
        let mut committee = committee().await;

        // Oracle 3 never hears the offer
        committee.oracle.remove_link(0, 3).await.unwrap();
        let payload = Bytes::from_static(b"only some oracles saw this");
        let certificate = committee.mailboxes[0]
            .broadcast_blob(payload.clone(), 10)
            .await
            .unwrap();
        assert!(!certificate.signers().any(|signer| signer == 3));

        let fetched = committee.mailboxes[3].fetch_blob(certificate).await.unwrap();
        assert_eq!(fetched, payload);
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_payload() {
        let committee = committee().await;
        let certificate = committee.mailboxes[1]
            .broadcast_blob(Bytes::new(), 5)
            .await
            .unwrap();
        assert!(certificate.metadata.chunk_digests.is_empty());
        let fetched = committee.mailboxes[2].fetch_blob(certificate).await.unwrap();
        assert!(fetched.is_empty());
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_certificate() {
        let committee = committee().await;
        let mut certificate = committee.mailboxes[0]
            .broadcast_blob(Bytes::from_static(b"payload"), 10)
            .await
            .unwrap();
        certificate.signatures.truncate(quorum() - 1);
        let result = committee.mailboxes[1].fetch_blob(certificate).await;
        assert!(matches!(result, Err(Error::InvalidCertificate)));
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_too_large() {
        let committee = committee().await;
        let payload = Bytes::from(vec![1u8; MAX_BLOB_SIZE + 1]);
        let result = committee.mailboxes[0].broadcast_blob(payload, 10).await;
        assert!(matches!(result, Err(Error::TooLarge(_))));
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_fails_pending_broadcast() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let mut committee = committee().await;
        for j in 1..N {
            committee.oracle.remove_link(0, j).await.unwrap();
        }

        let mailbox = committee.mailboxes[0].clone();
        let pending = tokio::spawn(async move {
            mailbox
                .broadcast_blob(Bytes::from_static(b"unheard"), 3)
                .await
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!pending.is_finished());

        committee.mailboxes[0].committed(3).await;
        assert!(matches!(pending.await.unwrap(), Err(Error::Expired)));

        // Expired blobs are removed from storage
        assert!(committee.dbs[0].is_empty().unwrap());

        // Broadcasting an already expired blob fails immediately
        let result = committee.mailboxes[0]
            .broadcast_blob(Bytes::from_static(b"late"), 2)
            .await;
        assert!(matches!(result, Err(Error::Expired)));
        committee.cancel.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_serves_persisted_blob() {
        let committee = committee().await;
        let payload = Bytes::from_static(b"survives a restart");
        let certificate = committee.mailboxes[0]
            .broadcast_blob(payload.clone(), 10)
            .await
            .unwrap();
        let _ = committee.mailboxes[1]
            .fetch_blob(certificate.clone())
            .await
            .unwrap();
        committee.cancel.cancel();

        // Restart oracle 1 on its existing database with no links
        let (network, mut oracle) = Network::new(simulated::Config::default());
        tokio::spawn(network.run());
        let channels = oracle.register(1, CHANNEL, 1024).await.unwrap();
        let (engine, mailbox) =
            Engine::new(config(1, &oracle, committee.dbs[1].clone())).unwrap();
        let cancel = CancellationToken::new();
        engine.start(channels, cancel.clone());

        let fetched = mailbox.fetch_blob(certificate).await.unwrap();
        assert_eq!(fetched, payload);
        cancel.cancel();
    }
}
