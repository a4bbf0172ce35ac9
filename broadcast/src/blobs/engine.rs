use super::{
    ingress::{Mailbox, Message},
    metrics::{Metrics, Status, StatusLabel},
    store,
    types::{chunk, sign_availability, verify_availability},
    wire::{self, Limits},
    BlobDigest, BlobMetadata, Config, LightCertifiedBlob,
};
use crate::Error;
use bytes::{Bytes, BytesMut};
use futures::{
    channel::{mpsc, oneshot},
    StreamExt,
};
use ocr_codec::{Decode, Encode};
use ocr_cryptography::{hash, PrivateKey, PublicKey, Signature};
use ocr_p2p::{
    utils::requester::{self, Requester, ID},
    Blocker, Receiver, Recipients, Sender,
};
use ocr_storage::kv::Database;
use ocr_utils::{byzantine_quorum, earliest, sleep_until, ConfigDigest, OracleId, SeqNr};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::Duration,
};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// A blob this oracle holds or is fetching.
struct Blob {
    metadata: BlobMetadata,

    /// Chunks not yet stored locally.
    missing: BTreeSet<u32>,

    /// Oracles believed to hold every chunk.
    holders: BTreeSet<OracleId>,
}

impl Blob {
    fn complete(&self) -> bool {
        self.missing.is_empty()
    }
}

/// A blob this oracle submitted and is collecting availability signatures for.
struct Submission {
    signatures: BTreeMap<OracleId, Signature>,
    responder: oneshot::Sender<Result<LightCertifiedBlob, Error>>,
    next_offer: Instant,
}

/// Disseminates blobs, fetches chunks from holders, and certifies availability.
pub struct Engine<B: Blocker> {
    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    me: OracleId,
    signer: PrivateKey,
    participants: Vec<PublicKey>,
    quorum: usize,
    config_digest: ConfigDigest,
    chunk_size: usize,
    max_blob_size: usize,
    limits: Limits,
    offer_resend: Duration,
    max_outstanding: usize,

    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    blocker: B,
    db: Database,
    mailbox_receiver: mpsc::Receiver<Message>,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    blobs: HashMap<BlobDigest, Blob>,
    submissions: HashMap<BlobDigest, Submission>,
    waiters: HashMap<BlobDigest, Vec<oneshot::Sender<Result<Bytes, Error>>>>,

    /// Highest committed sequence number seen.
    committed: SeqNr,

    ////////////////////////////////////////
    // Fetching
    ////////////////////////////////////////
    requester: Requester<OracleId>,
    outstanding: HashMap<(BlobDigest, u32), ID>,
    requests: HashMap<ID, (BlobDigest, u32)>,

    /// When rate limits allow another chunk request.
    retry_at: Option<Instant>,

    metrics: Metrics,
}

impl<B: Blocker> Engine<B> {
    /// Create a new engine, restoring any blobs left in `cfg.db`.
    pub fn new(cfg: Config<B>) -> Result<(Self, Mailbox), Error> {
        let (sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let metrics = Metrics::init(&cfg.registry);
        let n = cfg.participants.len() as u32;
        let quorum = byzantine_quorum(n, cfg.f) as usize;
        let limits = Limits {
            max_chunks: cfg.max_chunks(),
            chunk_size: cfg.chunk_size,
        };

        let mut requester = Requester::new(requester::Config {
            me: Some(cfg.me),
            rate_limit: cfg.rate_limit,
            initial: cfg.fetch_timeout / 2,
            timeout: cfg.fetch_timeout,
            seed: cfg.me as u64,
            registry: cfg.registry.clone(),
            metrics_prefix: "blob_requester",
        });
        let ids: Vec<OracleId> = (0..n).collect();
        requester.reconcile(&ids);

        let mut engine = Self {
            me: cfg.me,
            signer: cfg.signer,
            participants: cfg.participants,
            quorum,
            config_digest: cfg.config_digest,
            chunk_size: cfg.chunk_size,
            max_blob_size: cfg.max_blob_size,
            limits,
            offer_resend: cfg.offer_resend,
            max_outstanding: cfg.max_outstanding.max(1),

            blocker: cfg.blocker,
            db: cfg.db,
            mailbox_receiver,

            blobs: HashMap::new(),
            submissions: HashMap::new(),
            waiters: HashMap::new(),
            committed: 0,

            requester,
            outstanding: HashMap::new(),
            requests: HashMap::new(),
            retry_at: None,

            metrics,
        };
        engine.restore()?;
        Ok((engine, Mailbox::new(sender)))
    }

    /// Load metadata persisted by a previous run and note which chunks are still missing.
    fn restore(&mut self) -> Result<(), Error> {
        let txn = self.db.read_transaction();
        for (digest, metadata) in store::all_metadata(&txn)? {
            let mut missing = BTreeSet::new();
            for index in 0..metadata.chunk_digests.len() as u32 {
                if store::get_chunk(&txn, &digest, index)?.is_none() {
                    missing.insert(index);
                }
            }
            let holders = BTreeSet::from([metadata.submitter]);
            self.blobs.insert(
                digest,
                Blob {
                    metadata,
                    missing,
                    holders,
                },
            );
        }
        self.metrics.blobs.set(self.blobs.len() as i64);
        if !self.blobs.is_empty() {
            info!(blobs = self.blobs.len(), "restored blobs");
        }
        Ok(())
    }

    /// Spawn the engine on the current runtime.
    pub fn start<S: Sender, R: Receiver>(
        self,
        network: (S, R),
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(network, cancel))
    }

    /// Run until `cancel` fires or the mailbox closes.
    pub async fn run<S: Sender, R: Receiver>(
        mut self,
        (mut sender, mut receiver): (S, R),
        cancel: CancellationToken,
    ) {
        loop {
            self.cleanup_waiters();
            self.pump(&mut sender).await;

            let timeout = self.requester.next().map(|(_, deadline)| deadline);
            let offer = self.submissions.values().map(|s| s.next_offer).min();
            let deadline = earliest(earliest(timeout, offer), self.retry_at);

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
                    match mail {
                        Message::Broadcast { payload, expiry_seq_nr, responder } => {
                            trace!("mailbox: broadcast");
                            self.handle_broadcast(&mut sender, payload, expiry_seq_nr, responder)
                                .await;
                        }
                        Message::Fetch { certificate, responder } => {
                            trace!("mailbox: fetch");
                            self.handle_fetch(certificate, responder);
                        }
                        Message::Committed { seq_nr } => {
                            trace!(seq_nr, "mailbox: committed");
                            self.handle_committed(seq_nr);
                        }
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
                    let msg = match wire::Message::decode_cfg(msg, &self.limits) {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(?err, peer, "failed to decode message");
                            self.blocker.block(peer).await;
                            continue;
                        }
                    };
                    self.handle_network(&mut sender, peer, msg).await;
                },

                _ = sleep_until(deadline) => {
                    self.handle_deadline(&mut sender).await;
                },
            }
        }
    }

    fn cleanup_waiters(&mut self) {
        self.waiters.retain(|_, waiters| {
            waiters.retain(|responder| !responder.is_canceled());
            !waiters.is_empty()
        });
    }

    async fn send<S: Sender>(&self, sender: &mut S, recipients: Recipients, msg: wire::Message) {
        let priority = msg.class().priority();
        if let Err(err) = sender.send(recipients, msg.encode().freeze(), priority).await {
            debug!(?err, "failed to send");
        }
    }

    ////////////////////////////////////////
    // Submitting
    ////////////////////////////////////////

    async fn handle_broadcast<S: Sender>(
        &mut self,
        sender: &mut S,
        payload: Bytes,
        expiry_seq_nr: SeqNr,
        responder: oneshot::Sender<Result<LightCertifiedBlob, Error>>,
    ) {
        if payload.len() > self.max_blob_size {
            let _ = responder.send(Err(Error::TooLarge(payload.len())));
            return;
        }
        if expiry_seq_nr <= self.committed {
            let _ = responder.send(Err(Error::Expired));
            return;
        }

        let chunks = chunk(&payload, self.chunk_size);
        let metadata = BlobMetadata::new(self.me, &chunks, expiry_seq_nr);
        let digest = metadata.digest(&self.config_digest);
        if let Err(err) = self.persist(&digest, &metadata, &chunks) {
            error!(?err, "failed to persist blob");
            let _ = responder.send(Err(err));
            return;
        }
        self.blobs.insert(
            digest,
            Blob {
                metadata: metadata.clone(),
                missing: BTreeSet::new(),
                holders: BTreeSet::new(),
            },
        );
        self.metrics.blobs.set(self.blobs.len() as i64);

        let signature = sign_availability(&self.signer, &self.config_digest, &digest);
        let submission = Submission {
            signatures: BTreeMap::from([(self.me, signature)]),
            responder,
            next_offer: Instant::now() + self.offer_resend,
        };
        debug!(?digest, chunks = chunks.len(), expiry_seq_nr, "broadcasting blob");
        if let Some(submission) = self.try_certify(digest, submission) {
            self.submissions.insert(digest, submission);
            self.send(sender, Recipients::All, wire::Message::Offer(metadata))
                .await;
        }
    }

    fn persist(
        &self,
        digest: &BlobDigest,
        metadata: &BlobMetadata,
        chunks: &[Bytes],
    ) -> Result<(), Error> {
        let mut txn = self.db.unserialized_transaction();
        store::put_metadata(&mut txn, digest, metadata)?;
        for (index, chunk) in chunks.iter().enumerate() {
            store::put_chunk(&mut txn, digest, index as u32, chunk.clone())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Respond with a certificate if enough signatures were collected, else hand the submission
    /// back.
    fn try_certify(&mut self, digest: BlobDigest, submission: Submission) -> Option<Submission> {
        if submission.signatures.len() < self.quorum {
            return Some(submission);
        }
        let Some(blob) = self.blobs.get(&digest) else {
            let _ = submission.responder.send(Err(Error::Expired));
            return None;
        };
        let certificate = LightCertifiedBlob {
            metadata: blob.metadata.clone(),
            signatures: submission.signatures.into_iter().collect(),
        };
        info!(?digest, signers = certificate.signatures.len(), "blob certified");
        self.metrics.certified.inc();
        let _ = submission.responder.send(Ok(certificate));
        None
    }

    fn handle_available(&mut self, peer: OracleId, digest: BlobDigest, signature: Signature) {
        let Some(public_key) = self.participants.get(peer as usize) else {
            return;
        };
        if !verify_availability(public_key, &self.config_digest, &digest, &signature) {
            warn!(peer, ?digest, "invalid availability signature");
            return;
        }

        // Anyone attesting availability can serve chunks
        if let Some(blob) = self.blobs.get_mut(&digest) {
            if !blob.complete() {
                blob.holders.insert(peer);
            }
        }

        let Some(mut submission) = self.submissions.remove(&digest) else {
            return;
        };
        submission.signatures.insert(peer, signature);
        trace!(peer, ?digest, signatures = submission.signatures.len(), "availability");
        if let Some(submission) = self.try_certify(digest, submission) {
            self.submissions.insert(digest, submission);
        }
    }

    ////////////////////////////////////////
    // Fetching
    ////////////////////////////////////////

    async fn handle_offer<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        metadata: BlobMetadata,
    ) {
        if peer == self.me {
            return;
        }
        if metadata.submitter != peer {
            warn!(peer, submitter = metadata.submitter, "offer for another submitter");
            return;
        }
        if !metadata.is_valid(self.chunk_size, self.max_blob_size) {
            warn!(peer, "invalid blob metadata");
            return;
        }
        if metadata.expiry_seq_nr <= self.committed {
            trace!(peer, expiry = metadata.expiry_seq_nr, "offer already expired");
            return;
        }

        let digest = metadata.digest(&self.config_digest);
        if let Some(blob) = self.blobs.get(&digest) {
            // The submitter may have missed our attestation
            if blob.complete() {
                let signature = sign_availability(&self.signer, &self.config_digest, &digest);
                self.send(
                    sender,
                    Recipients::One(peer),
                    wire::Message::Available { blob: digest, signature },
                )
                .await;
            }
            return;
        }
        if let Err(err) = self.track(digest, metadata, [peer]) {
            error!(?err, "failed to track blob");
            return;
        }
        debug!(peer, ?digest, "accepted offer");
        self.check_complete(sender, digest).await;
    }

    /// Start fetching a blob not yet known.
    fn track(
        &mut self,
        digest: BlobDigest,
        metadata: BlobMetadata,
        holders: impl IntoIterator<Item = OracleId>,
    ) -> Result<(), Error> {
        let mut txn = self.db.unserialized_transaction();
        store::put_metadata(&mut txn, &digest, &metadata)?;
        txn.commit()?;
        let missing = (0..metadata.chunk_digests.len() as u32).collect();
        self.blobs.insert(
            digest,
            Blob {
                metadata,
                missing,
                holders: holders.into_iter().collect(),
            },
        );
        self.metrics.blobs.set(self.blobs.len() as i64);
        Ok(())
    }

    fn handle_fetch(
        &mut self,
        certificate: LightCertifiedBlob,
        responder: oneshot::Sender<Result<Bytes, Error>>,
    ) {
        if !certificate.verify(&self.config_digest, &self.participants, self.quorum) {
            let _ = responder.send(Err(Error::InvalidCertificate));
            return;
        }
        let metadata = &certificate.metadata;
        if !metadata.is_valid(self.chunk_size, self.max_blob_size) {
            let _ = responder.send(Err(Error::InvalidCertificate));
            return;
        }
        if metadata.expiry_seq_nr <= self.committed {
            let _ = responder.send(Err(Error::Expired));
            return;
        }

        let digest = certificate.digest(&self.config_digest);
        let complete = match self.blobs.get_mut(&digest) {
            Some(blob) => {
                blob.holders.extend(certificate.signers());
                blob.complete()
            }
            None => {
                let signers: Vec<OracleId> = certificate.signers().collect();
                if let Err(err) = self.track(digest, certificate.metadata, signers) {
                    let _ = responder.send(Err(err));
                    return;
                }
                // An empty payload has no chunks to fetch
                self.blobs.get(&digest).is_some_and(Blob::complete)
            }
        };
        if complete {
            let _ = responder.send(self.assemble(&digest));
            return;
        }
        debug!(?digest, "waiting for blob");
        self.waiters.entry(digest).or_default().push(responder);
    }

    /// Issue chunk requests for every incomplete blob, up to the per-blob limit.
    async fn pump<S: Sender>(&mut self, sender: &mut S) {
        if self.retry_at.is_some_and(|at| at > Instant::now()) {
            return;
        }
        self.retry_at = None;

        let mut issued = Vec::new();
        'blobs: for (digest, blob) in self.blobs.iter() {
            let mut inflight = blob
                .missing
                .iter()
                .filter(|index| self.outstanding.contains_key(&(*digest, **index)))
                .count();
            for index in blob.missing.iter() {
                if inflight >= self.max_outstanding {
                    break;
                }
                if self.outstanding.contains_key(&(*digest, *index)) {
                    continue;
                }
                match self
                    .requester
                    .request_filtered(false, |peer| blob.holders.contains(peer))
                {
                    Ok((peer, id)) => {
                        self.outstanding.insert((*digest, *index), id);
                        self.requests.insert(id, (*digest, *index));
                        issued.push((peer, *digest, *index));
                        inflight += 1;
                    }
                    Err(requester::Error::RateLimited(wait)) => {
                        self.retry_at = earliest(self.retry_at, Some(Instant::now() + wait));
                        break 'blobs;
                    }
                    Err(requester::Error::NoEligibleParticipants) => break,
                }
            }
        }

        for (peer, blob, index) in issued {
            trace!(peer, ?blob, index, "requesting chunk");
            self.send(
                sender,
                Recipients::One(peer),
                wire::Message::ChunkRequest { blob, index },
            )
            .await;
        }
    }

    async fn handle_chunk<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        digest: BlobDigest,
        index: u32,
        chunk: Option<Bytes>,
    ) {
        let Some(id) = self.outstanding.get(&(digest, index)).copied() else {
            trace!(peer, ?digest, index, "unsolicited chunk");
            return;
        };
        let Some(request) = self.requester.handle(&peer, id) else {
            trace!(peer, ?digest, index, "chunk from unexpected peer");
            return;
        };
        self.outstanding.remove(&(digest, index));
        self.requests.remove(&id);
        let Some(blob) = self.blobs.get_mut(&digest) else {
            return;
        };

        let Some(chunk) = chunk else {
            debug!(peer, ?digest, index, "holder does not have chunk");
            self.metrics
                .chunks
                .get_or_create(&StatusLabel::new(Status::Missing))
                .inc();
            blob.holders.remove(&peer);
            self.requester.fail(request);
            return;
        };

        let expected_length = blob.metadata.chunk_length(index as usize, self.chunk_size);
        let valid = blob
            .metadata
            .chunk_digests
            .get(index as usize)
            .is_some_and(|expected| *expected == hash(&chunk))
            && chunk.len() == expected_length;
        if !valid {
            warn!(peer, ?digest, index, "invalid chunk");
            self.metrics
                .chunks
                .get_or_create(&StatusLabel::new(Status::Invalid))
                .inc();
            blob.holders.remove(&peer);
            self.requester.fail(request);
            self.requester.block(peer);
            self.blocker.block(peer).await;
            return;
        }

        let mut txn = self.db.unserialized_transaction();
        let stored = store::put_chunk(&mut txn, &digest, index, chunk).and_then(|_| txn.commit());
        if let Err(err) = stored {
            error!(?err, "failed to store chunk");
            return;
        }
        blob.missing.remove(&index);
        self.requester.resolve(request);
        self.metrics
            .chunks
            .get_or_create(&StatusLabel::new(Status::Success))
            .inc();
        self.check_complete(sender, digest).await;
    }

    /// Attest availability and serve waiters once every chunk of `digest` is held.
    async fn check_complete<S: Sender>(&mut self, sender: &mut S, digest: BlobDigest) {
        let Some(blob) = self.blobs.get(&digest) else {
            return;
        };
        if !blob.complete() {
            return;
        }
        let submitter = blob.metadata.submitter;
        debug!(?digest, "blob complete");

        if submitter != self.me {
            let signature = sign_availability(&self.signer, &self.config_digest, &digest);
            self.send(
                sender,
                Recipients::One(submitter),
                wire::Message::Available { blob: digest, signature },
            )
            .await;
        }

        if let Some(waiters) = self.waiters.remove(&digest) {
            for waiter in waiters {
                let _ = waiter.send(self.assemble(&digest));
            }
        }
    }

    fn assemble(&self, digest: &BlobDigest) -> Result<Bytes, Error> {
        let Some(blob) = self.blobs.get(digest) else {
            return Err(Error::Expired);
        };
        let txn = self.db.read_transaction();
        let mut payload = BytesMut::with_capacity(blob.metadata.payload_length as usize);
        for index in 0..blob.metadata.chunk_digests.len() as u32 {
            let chunk = store::get_chunk(&txn, digest, index)?
                .ok_or(ocr_storage::kv::Error::Corrupt("missing blob chunk"))?;
            payload.extend_from_slice(&chunk);
        }
        Ok(payload.freeze())
    }

    async fn handle_chunk_request<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        digest: BlobDigest,
        index: u32,
    ) {
        let chunk = if self.blobs.contains_key(&digest) {
            store::get_chunk(&self.db.read_transaction(), &digest, index).unwrap_or_else(|err| {
                error!(?err, "failed to read chunk");
                None
            })
        } else {
            None
        };
        let status = if chunk.is_some() {
            Status::Success
        } else {
            Status::Missing
        };
        self.metrics.served.get_or_create(&StatusLabel::new(status)).inc();
        self.send(
            sender,
            Recipients::One(peer),
            wire::Message::ChunkResponse {
                blob: digest,
                index,
                chunk,
            },
        )
        .await;
    }

    ////////////////////////////////////////
    // Events
    ////////////////////////////////////////

    async fn handle_network<S: Sender>(
        &mut self,
        sender: &mut S,
        peer: OracleId,
        msg: wire::Message,
    ) {
        match msg {
            wire::Message::Offer(metadata) => self.handle_offer(sender, peer, metadata).await,
            wire::Message::ChunkRequest { blob, index } => {
                self.handle_chunk_request(sender, peer, blob, index).await
            }
            wire::Message::ChunkResponse { blob, index, chunk } => {
                self.handle_chunk(sender, peer, blob, index, chunk).await
            }
            wire::Message::Available { blob, signature } => {
                self.handle_available(peer, blob, signature)
            }
        }
    }

    async fn handle_deadline<S: Sender>(&mut self, sender: &mut S) {
        let now = Instant::now();

        // Chunk requests that were never answered
        while let Some((id, deadline)) = self.requester.next() {
            if deadline > now {
                break;
            }
            let Some(request) = self.requester.cancel(id) else {
                break;
            };
            if let Some(key) = self.requests.remove(&id) {
                debug!(
                    peer = request.participant,
                    blob = ?key.0,
                    index = key.1,
                    "chunk request timed out"
                );
                self.outstanding.remove(&key);
            }
            self.requester.timeout(request);
        }

        // Submissions still short of a certificate
        let mut resend = Vec::new();
        for (digest, submission) in self.submissions.iter_mut() {
            if submission.next_offer > now {
                continue;
            }
            submission.next_offer = now + self.offer_resend;
            let pending: Vec<OracleId> = (0..self.participants.len() as OracleId)
                .filter(|id| !submission.signatures.contains_key(id))
                .collect();
            if let Some(blob) = self.blobs.get(digest) {
                resend.push((pending, blob.metadata.clone()));
            }
        }
        for (pending, metadata) in resend {
            trace!(pending = pending.len(), "re-offering blob");
            self.send(sender, Recipients::Some(pending), wire::Message::Offer(metadata))
                .await;
        }
    }

    /// Drop every blob that expires at or before `seq_nr`.
    fn handle_committed(&mut self, seq_nr: SeqNr) {
        if seq_nr <= self.committed {
            return;
        }
        self.committed = seq_nr;

        let expired: Vec<BlobDigest> = self
            .blobs
            .iter()
            .filter(|(_, blob)| blob.metadata.expiry_seq_nr <= seq_nr)
            .map(|(digest, _)| *digest)
            .collect();
        if expired.is_empty() {
            return;
        }

        let mut txn = self.db.unserialized_transaction();
        for digest in expired.iter() {
            self.blobs.remove(digest);
            if let Err(err) = store::delete(&mut txn, digest) {
                error!(?err, "failed to delete blob");
            }
            if let Some(submission) = self.submissions.remove(digest) {
                let _ = submission.responder.send(Err(Error::Expired));
            }
            for waiter in self.waiters.remove(digest).into_iter().flatten() {
                let _ = waiter.send(Err(Error::Expired));
            }
        }
        if let Err(err) = txn.commit() {
            error!(?err, "failed to commit blob reaping");
        }

        let stale: Vec<(BlobDigest, u32)> = self
            .outstanding
            .keys()
            .filter(|(digest, _)| !self.blobs.contains_key(digest))
            .copied()
            .collect();
        for key in stale {
            if let Some(id) = self.outstanding.remove(&key) {
                self.requests.remove(&id);
                self.requester.cancel(id);
            }
        }

        self.metrics.blobs.set(self.blobs.len() as i64);
        debug!(seq_nr, reaped = expired.len(), "reaped expired blobs");
    }
}
