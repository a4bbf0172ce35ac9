use crate::{
    reporter,
    restore::{with_backoff, Restored},
    Config, Error,
};
use futures::{stream::FuturesUnordered, StreamExt};
use ocr_broadcast::blobs;
use ocr_consensus::{attestation, outcome, pacemaker, transmission, ContractTransmitter, Plugin};
use ocr_p2p::{Blocker, Receiver, Sender};
use ocr_sync::{blocks, reaper, tree};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// One sender and receiver pair per component, each bound to its [channel](crate::channel).
pub struct Channels<S: Sender, R: Receiver> {
    pub pacemaker: (S, R),
    pub outcome: (S, R),
    pub attestation: (S, R),
    pub blocks: (S, R),
    pub tree: (S, R),
    pub blobs: (S, R),
}

/// A committee member.
pub struct Oracle<P: Plugin, T: ContractTransmitter, B: Blocker> {
    cfg: Config<P, T, B>,

    blobs: blobs::Engine<B>,
    blobs_mailbox: blobs::Mailbox,
}

async fn supervise(name: &'static str, handle: JoinHandle<()>) -> &'static str {
    if let Err(err) = handle.await {
        error!(component = name, ?err, "task failed");
    }
    name
}

impl<P: Plugin, T: ContractTransmitter, B: Blocker> Oracle<P, T, B> {
    /// Check `cfg` and prepare blob exchange. Returns the mailbox plugins use to broadcast and
    /// fetch blobs.
    pub fn new(cfg: Config<P, T, B>) -> Result<(Self, blobs::Mailbox), Error> {
        cfg.shared.validate()?;
        let (blobs, blobs_mailbox) = blobs::Engine::new(blobs::Config {
            me: cfg.me,
            signer: cfg.signer.clone(),
            participants: cfg.shared.oracles.clone(),
            f: cfg.shared.f,
            config_digest: cfg.shared.config_digest,
            blocker: cfg.blocker.clone(),
            db: cfg.db.clone(),
            chunk_size: cfg.blob_chunk_size,
            max_blob_size: cfg.max_blob_size,
            offer_resend: cfg.blob_offer_resend,
            fetch_timeout: cfg.fetch_timeout,
            rate_limit: cfg.fetch_rate_limit,
            max_outstanding: cfg.max_outstanding,
            mailbox_size: cfg.mailbox_size,
            registry: cfg.registry.clone(),
        })?;
        Ok((
            Self {
                cfg,
                blobs,
                blobs_mailbox: blobs_mailbox.clone(),
            },
            blobs_mailbox,
        ))
    }

    /// Spawn the oracle on the current runtime.
    ///
    /// Resolves with `Ok` once `cancel` fires and every component stopped, or with an error if
    /// restoring state failed or some component stopped on its own.
    pub fn start<S: Sender, R: Receiver>(
        self,
        channels: Channels<S, R>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.run(channels, cancel))
    }

    async fn run<S: Sender, R: Receiver>(
        self,
        channels: Channels<S, R>,
        cancel: CancellationToken,
    ) -> Result<(), Error> {
        let cfg = self.cfg;
        let me = cfg.me;

        // Restore durable state
        let restore = with_backoff(
            cfg.restore_attempts,
            cfg.restore_backoff,
            cfg.restore_max_backoff,
            || Restored::load(&cfg.db, &cfg.shared),
        );
        let restored = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(me, "shutdown during restore");
                return Ok(());
            },
            restored = restore => restored?,
        };
        info!(
            me,
            epoch = restored.pacemaker.epoch,
            committed = restored.committed.seq_nr,
            highest_certified = restored.highest_certified.seq_nr(),
            tree_sync = ?restored.tree_sync.phase,
            persisted = ?restored.persisted,
            "restored"
        );

        // Create the components
        let (pacemaker, pacemaker_mailbox) = pacemaker::Actor::new(pacemaker::Config {
            me,
            shared: cfg.shared.clone(),
            db: cfg.db.clone(),
            mailbox_size: cfg.mailbox_size,
            registry: cfg.registry.clone(),
        })?;
        let (outcome, outcome_mailbox) = outcome::Actor::new(outcome::Config {
            me,
            signer: cfg.signer.clone(),
            shared: cfg.shared.clone(),
            plugin: cfg.plugin.clone(),
            blocker: cfg.blocker.clone(),
            db: cfg.db.clone(),
            max_buffered_per_sender: cfg.max_buffered_per_sender,
            mailbox_size: cfg.mailbox_size,
            registry: cfg.registry.clone(),
        });
        let (attestation, attestation_mailbox) = attestation::Actor::new(attestation::Config {
            me,
            signer: cfg.signer,
            shared: cfg.shared.clone(),
            plugin: cfg.plugin.clone(),
            blocker: cfg.blocker.clone(),
            window: cfg.report_window,
            mailbox_size: cfg.mailbox_size,
            registry: cfg.registry.clone(),
        });
        let (transmission, transmission_mailbox) = transmission::Actor::new(transmission::Config {
            me,
            shared: cfg.shared.clone(),
            plugin: cfg.plugin,
            transmitter: cfg.transmitter,
            window: cfg.report_window,
            mailbox_size: cfg.mailbox_size,
            registry: cfg.registry.clone(),
        });
        let reaping = reporter::Reaping {
            blobs: self.blobs_mailbox.clone(),
        };
        let (block_persistence, blocks_mailbox) = blocks::Actor::new(blocks::Config {
            me,
            shared: cfg.shared.clone(),
            db: cfg.db.clone(),
            blocker: cfg.blocker.clone(),
            reporter: reaping.clone(),
            rate_limit: cfg.fetch_rate_limit,
            fetch_timeout: cfg.fetch_timeout,
            mailbox_size: cfg.mailbox_size,
            registry: cfg.registry.clone(),
        });
        let state_sync = tree::Actor::new(tree::Config {
            me,
            shared: cfg.shared.clone(),
            db: cfg.db.clone(),
            blocker: cfg.blocker,
            blocks: blocks_mailbox.clone(),
            reporter: reaping,
            rate_limit: cfg.fetch_rate_limit,
            fetch_timeout: cfg.fetch_timeout,
            ranges: cfg.tree_sync_ranges,
            max_outstanding: cfg.max_outstanding,
            registry: cfg.registry.clone(),
        });
        let reaper = reaper::Reaper::new(reaper::Config {
            db: cfg.db,
            snapshot_interval: cfg.shared.snapshot_interval,
            interval: cfg.reap_interval,
            retry: cfg.reap_interval / 4,
            batch: cfg.reap_batch,
            registry: cfg.registry,
        });
        let outcome_reporter = reporter::Outcome {
            blocks: blocks_mailbox,
            blobs: self.blobs_mailbox,
        };

        // Start the components, consumers first
        let children = cancel.child_token();
        let mut tasks = FuturesUnordered::new();
        tasks.push(supervise(
            "transmission",
            transmission.start(children.clone()),
        ));
        tasks.push(supervise(
            "attestation",
            attestation.start(transmission_mailbox, channels.attestation, children.clone()),
        ));
        tasks.push(supervise(
            "blocks",
            block_persistence.start(channels.blocks, children.clone()),
        ));
        tasks.push(supervise(
            "tree",
            state_sync.start(channels.tree, children.clone()),
        ));
        tasks.push(supervise(
            "blobs",
            self.blobs.start(channels.blobs, children.clone()),
        ));
        tasks.push(supervise(
            "outcome",
            outcome.start(
                pacemaker_mailbox,
                attestation_mailbox,
                outcome_reporter,
                channels.outcome,
                children.clone(),
            ),
        ));
        tasks.push(supervise(
            "pacemaker",
            pacemaker.start(outcome_mailbox, channels.pacemaker, children.clone()),
        ));
        tasks.push(supervise("reaper", reaper.start(children.clone())));
        info!(me, "started");

        // Wait for shutdown or for any component to stop (which indicates a failure)
        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(me, "shutdown");
                Ok(())
            },
            Some(name) = tasks.next() => {
                error!(me, component = name, "stopped unexpectedly");
                Err(Error::Stopped(name))
            },
        };
        children.cancel();
        while tasks.next().await.is_some() {}
        debug!(me, "stopped");
        result
    }
}
