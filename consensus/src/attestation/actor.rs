use super::{
    ingress::{Mailbox, Message},
    metrics::{Metrics, Status},
    Config,
};
use crate::{
    plugin::{bounded, Plugin, PluginError},
    transmission,
    types::{AttestedReport, ReportWithInfo},
    wire, SharedConfig,
};
use futures::{channel::mpsc, StreamExt};
use ocr_codec::{Decode, Encode};
use ocr_cryptography::{PrivateKey, Signature};
use ocr_p2p::{Blocker, Receiver, Recipients, Sender};
use ocr_utils::{OracleId, SeqNr};
use std::collections::{BTreeMap, BTreeSet};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

/// Signatures gathered for the reports of one committed block.
#[derive(Default)]
struct Entry {
    /// Known once the local plugin has expanded the block.
    reports: Option<Vec<ReportWithInfo>>,

    /// Signatures received before the reports were known, per signer.
    unverified: BTreeMap<OracleId, Vec<Signature>>,

    /// Verified signatures, per report index and signer.
    verified: Vec<BTreeMap<OracleId, Signature>>,

    /// Signers whose signatures were already accepted.
    signers: BTreeSet<OracleId>,

    /// Set once the local plugin was asked for the reports.
    requested: bool,

    /// Per report index, whether it was already handed to transmission.
    attested: Vec<bool>,
}

/// Gathers signatures over the reports of every committed block.
pub struct Actor<P: Plugin, B: Blocker> {
    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    me: OracleId,
    signer: PrivateKey,
    shared: SharedConfig,
    window: u64,

    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    plugin: P,
    blocker: B,
    mailbox_receiver: mpsc::Receiver<Message>,
    expanded: mpsc::UnboundedSender<(SeqNr, Result<Vec<ReportWithInfo>, PluginError>)>,
    expanded_receiver: mpsc::UnboundedReceiver<(SeqNr, Result<Vec<ReportWithInfo>, PluginError>)>,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    highest_committed: SeqNr,
    entries: BTreeMap<SeqNr, Entry>,

    metrics: Metrics,
}

impl<P: Plugin, B: Blocker> Actor<P, B> {
    pub fn new(cfg: Config<P, B>) -> (Self, Mailbox) {
        let (sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let (expanded, expanded_receiver) = mpsc::unbounded();
        let metrics = Metrics::init(&cfg.registry);
        (
            Self {
                me: cfg.me,
                signer: cfg.signer,
                shared: cfg.shared,
                window: cfg.window,

                plugin: cfg.plugin,
                blocker: cfg.blocker,
                mailbox_receiver,
                expanded,
                expanded_receiver,

                highest_committed: 0,
                entries: BTreeMap::new(),

                metrics,
            },
            Mailbox::new(sender),
        )
    }

    /// Spawn report attestation on the current runtime.
    pub fn start<S: Sender, R: Receiver>(
        self,
        transmission: transmission::Mailbox,
        network: (S, R),
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(transmission, network, cancel))
    }

    async fn run<S: Sender, R: Receiver>(
        mut self,
        mut transmission: transmission::Mailbox,
        (mut sender, mut receiver): (S, R),
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("shutdown");
                    return;
                },

                mail = self.mailbox_receiver.next() => {
                    let Some(Message::Committed { seq_nr, reports_plus_precursor }) = mail else {
                        debug!("mailbox closed");
                        return;
                    };
                    self.highest_committed = self.highest_committed.max(seq_nr);
                    self.prune();
                    let entry = self.entries.entry(seq_nr).or_default();
                    if entry.requested {
                        continue;
                    }
                    entry.requested = true;

                    let plugin = self.plugin.clone();
                    let timeout = self.shared.timeouts.reports;
                    let expanded = self.expanded.clone();
                    tokio::spawn(async move {
                        let result =
                            bounded(timeout, plugin.reports(seq_nr, &reports_plus_precursor))
                                .await;
                        let _ = expanded.unbounded_send((seq_nr, result));
                    });
                },

                Some((seq_nr, result)) = self.expanded_receiver.next() => {
                    self.handle_expanded(&mut sender, &mut transmission, seq_nr, result).await;
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
                        continue;
                    }
                    let wire::Attestation::ReportSignatures { seq_nr, signatures } =
                        match wire::Attestation::decode_cfg(msg, &self.shared.limits) {
                            Ok(msg) if msg.check_size(&self.shared.limits, self.shared.n()) => msg,
                            result => {
                                warn!(err = ?result.err(), peer, "invalid message");
                                self.metrics.inbound(Status::Invalid);
                                self.blocker.block(peer).await;
                                continue;
                            }
                        };
                    self.handle_signatures(&mut transmission, peer, seq_nr, signatures).await;
                },
            }
        }
    }

    /// Forget blocks that fell out of the window.
    fn prune(&mut self) {
        let oldest = self.highest_committed.saturating_sub(self.window);
        self.entries = self.entries.split_off(&oldest);
        self.metrics.pending.set(self.entries.len() as i64);
    }

    async fn handle_expanded<S: Sender>(
        &mut self,
        sender: &mut S,
        transmission: &mut transmission::Mailbox,
        seq_nr: SeqNr,
        result: Result<Vec<ReportWithInfo>, PluginError>,
    ) {
        let limits = self.shared.limits;
        let reports = match result {
            Ok(reports) if reports.len() <= limits.max_report_count => reports,
            Ok(reports) => {
                warn!(seq_nr, count = reports.len(), "too many reports");
                self.metrics.failed.inc();
                return;
            }
            Err(err) => {
                warn!(?err, seq_nr, "failed to expand reports");
                self.metrics.failed.inc();
                return;
            }
        };
        if reports.iter().any(|r| {
            r.report.len() > limits.max_report_length || r.info.len() > limits.max_report_length
        }) {
            warn!(seq_nr, "report too large");
            self.metrics.failed.inc();
            return;
        }
        let Some(entry) = self.entries.get_mut(&seq_nr) else {
            return;
        };
        if reports.is_empty() {
            trace!(seq_nr, "no reports");
            self.entries.remove(&seq_nr);
            return;
        }

        let signatures = reports
            .iter()
            .enumerate()
            .map(|(index, report)| {
                report.sign(&self.signer, &self.shared.config_digest, seq_nr, index as u32)
            })
            .collect();
        entry.verified = vec![BTreeMap::new(); reports.len()];
        entry.attested = vec![false; reports.len()];
        entry.reports = Some(reports);
        debug!(seq_nr, me = self.me, "signed reports");

        let msg = wire::Attestation::ReportSignatures { seq_nr, signatures };
        if let Err(err) = sender
            .send(Recipients::All, msg.encode().freeze(), msg.class().priority())
            .await
        {
            debug!(?err, "failed to send report signatures");
        }

        // Signatures that arrived before the reports were known
        let unverified = self
            .entries
            .get_mut(&seq_nr)
            .map(|entry| std::mem::take(&mut entry.unverified))
            .unwrap_or_default();
        for (peer, signatures) in unverified {
            self.verify(transmission, peer, seq_nr, signatures).await;
        }
    }

    async fn handle_signatures(
        &mut self,
        transmission: &mut transmission::Mailbox,
        peer: OracleId,
        seq_nr: SeqNr,
        signatures: Vec<Signature>,
    ) {
        let oldest = self.highest_committed.saturating_sub(self.window);
        if seq_nr < oldest || seq_nr > self.highest_committed + self.window {
            trace!(peer, seq_nr, "signatures outside window");
            self.metrics.inbound(Status::Dropped);
            return;
        }
        let entry = self.entries.entry(seq_nr).or_default();
        if entry.signers.contains(&peer) {
            return;
        }
        if entry.reports.is_none() {
            entry.unverified.entry(peer).or_insert(signatures);
            return;
        }
        self.verify(transmission, peer, seq_nr, signatures).await;
    }

    async fn verify(
        &mut self,
        transmission: &mut transmission::Mailbox,
        peer: OracleId,
        seq_nr: SeqNr,
        signatures: Vec<Signature>,
    ) {
        let quorum = self.shared.quorum();
        let Some(entry) = self.entries.get_mut(&seq_nr) else {
            return;
        };
        let Some(reports) = entry.reports.as_ref() else {
            return;
        };
        let public_key = &self.shared.oracles[peer as usize];
        let valid = signatures.len() == reports.len()
            && reports.iter().zip(signatures.iter()).enumerate().all(
                |(index, (report, signature))| {
                    report.verify(
                        public_key,
                        &self.shared.config_digest,
                        seq_nr,
                        index as u32,
                        signature,
                    )
                },
            );
        if !valid {
            warn!(peer, seq_nr, "invalid report signatures");
            self.metrics.inbound(Status::Invalid);
            self.blocker.block(peer).await;
            return;
        }
        self.metrics.inbound(Status::Processed);
        entry.signers.insert(peer);
        for (index, signature) in signatures.into_iter().enumerate() {
            entry.verified[index].insert(peer, signature);
        }

        let mut ready = Vec::new();
        for (index, report) in reports.iter().enumerate() {
            if entry.attested[index] || entry.verified[index].len() < quorum {
                continue;
            }
            entry.attested[index] = true;
            ready.push(AttestedReport {
                seq_nr,
                index: index as u32,
                report: report.clone(),
                signatures: entry.verified[index]
                    .iter()
                    .map(|(signer, signature)| (*signer, *signature))
                    .collect(),
            });
        }
        for report in ready {
            debug!(seq_nr, index = report.index, "report attested");
            self.metrics.attested.inc();
            transmission.attested(report).await;
        }
    }
}
