use super::{
    ingress::{Mailbox, Message},
    metrics::Metrics,
    Config,
};
use crate::{
    outcome,
    state::{self, PacemakerState},
    wire, Error, SharedConfig,
};
use futures::{channel::mpsc, StreamExt};
use ocr_codec::{DecodeExt, Encode};
use ocr_p2p::{Receiver, Recipients, Sender};
use ocr_storage::kv::Database;
use ocr_utils::{earliest, sleep_until, Epoch, OracleId};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Drives epoch changes.
pub struct Actor {
    ////////////////////////////////////////
    // Configuration
    ////////////////////////////////////////
    me: OracleId,
    shared: SharedConfig,

    ////////////////////////////////////////
    // Interfaces
    ////////////////////////////////////////
    db: Database,
    mailbox_receiver: mpsc::Receiver<Message>,

    ////////////////////////////////////////
    // State
    ////////////////////////////////////////
    epoch: Epoch,
    highest_wish: Epoch,

    /// Highest epoch each oracle has wished for.
    wishes: Vec<Epoch>,

    progress_deadline: Option<Instant>,
    resend_deadline: Option<Instant>,

    /// When to retry after state could not be persisted, and the highest wish that failed.
    retry_deadline: Option<Instant>,
    retry_wish: Epoch,

    metrics: Metrics,
}

impl Actor {
    /// Create a new pacemaker, resuming from the state persisted in `cfg.db`.
    pub fn new(cfg: Config) -> Result<(Self, Mailbox), Error> {
        let (sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let metrics = Metrics::init(&cfg.registry);
        let persisted = state::read_pacemaker_state(&cfg.db.read_transaction())?;
        let n = cfg.shared.n();
        Ok((
            Self {
                me: cfg.me,
                shared: cfg.shared,

                db: cfg.db,
                mailbox_receiver,

                epoch: persisted.epoch,
                highest_wish: persisted.highest_sent_new_epoch_wish.max(persisted.epoch),
                wishes: vec![0; n],
                progress_deadline: None,
                resend_deadline: None,
                retry_deadline: None,
                retry_wish: 0,

                metrics,
            },
            Mailbox::new(sender),
        ))
    }

    /// Spawn the pacemaker on the current runtime.
    pub fn start<S: Sender, R: Receiver>(
        self,
        outcome: outcome::Mailbox,
        network: (S, R),
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(outcome, network, cancel))
    }

    async fn run<S: Sender, R: Receiver>(
        mut self,
        mut outcome: outcome::Mailbox,
        (mut sender, mut receiver): (S, R),
        cancel: CancellationToken,
    ) {
        // Resume in the persisted epoch
        self.wishes[self.me as usize] = self.highest_wish;
        self.metrics.epoch.set(self.epoch as i64);
        self.metrics.wish.set(self.highest_wish as i64);
        info!(epoch = self.epoch, "starting epoch");
        outcome
            .start_epoch(self.epoch, self.shared.leader(self.epoch))
            .await;
        self.progress_deadline = Some(Instant::now() + self.shared.delta_progress);
        if self.highest_wish > self.epoch {
            self.resend_deadline = Some(Instant::now());
        }

        loop {
            let deadline = earliest(
                earliest(self.progress_deadline, self.resend_deadline),
                self.retry_deadline,
            );
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
                        Message::Progress => {
                            trace!(epoch = self.epoch, "progress");
                            if self.highest_wish <= self.epoch {
                                self.progress_deadline =
                                    Some(Instant::now() + self.shared.delta_progress);
                            }
                        }
                        Message::ChangeLeader => {
                            debug!(epoch = self.epoch, "leader asked to change");
                            let wish = self.highest_wish.max(self.epoch + 1);
                            self.wish(&mut sender, wish).await;
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
                    if peer as usize >= self.wishes.len() {
                        debug!(peer, "message from unknown oracle");
                        continue;
                    }
                    let msg = wire::Pacemaker::decode(msg);
                    let wire::Pacemaker::NewEpochWish { epoch } = match msg {
                        Ok(msg) => msg,
                        Err(err) => {
                            warn!(?err, peer, "failed to decode message");
                            continue;
                        }
                    };
                    trace!(peer, epoch, "new epoch wish");
                    if epoch <= self.wishes[peer as usize] {
                        continue;
                    }
                    self.wishes[peer as usize] = epoch;
                    self.evaluate(&mut sender, &mut outcome).await;
                },

                _ = sleep_until(deadline) => {
                    let now = Instant::now();
                    if self.progress_deadline.is_some_and(|d| d <= now) {
                        self.metrics.timeouts.inc();
                        info!(epoch = self.epoch, "progress timeout");
                        self.progress_deadline = None;
                        let wish = self.highest_wish.max(self.epoch + 1);
                        self.wish(&mut sender, wish).await;
                    } else if self.retry_deadline.is_some_and(|d| d <= now) {
                        self.retry_deadline = None;
                        let wish = std::mem::take(&mut self.retry_wish);
                        if wish > self.highest_wish {
                            self.wish(&mut sender, wish).await;
                        }
                        self.evaluate(&mut sender, &mut outcome).await;
                    } else if self.resend_deadline.is_some_and(|d| d <= now) {
                        self.broadcast_wish(&mut sender).await;
                    }
                },
            }
        }
    }

    fn persist(&self, epoch: Epoch, highest_wish: Epoch) -> Result<(), Error> {
        // Nothing else writes pacemaker state, so commits by other components cannot conflict
        let mut txn = self.db.unserialized_transaction();
        state::write_pacemaker_state(
            &mut txn,
            &PacemakerState {
                epoch,
                highest_sent_new_epoch_wish: highest_wish,
            },
        )?;
        txn.commit()?;
        Ok(())
    }

    /// Try `wish` (and any pending epoch change) again after `delta_resend`.
    fn schedule_retry(&mut self, wish: Epoch) {
        self.retry_wish = self.retry_wish.max(wish);
        self.retry_deadline = Some(Instant::now() + self.shared.delta_resend);
    }

    async fn broadcast_wish<S: Sender>(&mut self, sender: &mut S) {
        let msg = wire::Pacemaker::NewEpochWish {
            epoch: self.highest_wish,
        };
        let priority = msg.class().priority();
        if let Err(err) = sender
            .send(Recipients::All, msg.encode().freeze(), priority)
            .await
        {
            debug!(?err, "failed to send wish");
        }
        self.resend_deadline = Some(Instant::now() + self.shared.delta_resend);
    }

    /// Wish for `epoch` (if higher than the current wish) and announce it.
    ///
    /// A wish that cannot be persisted is not announced, and is retried later.
    async fn wish<S: Sender>(&mut self, sender: &mut S, epoch: Epoch) {
        if epoch > self.highest_wish {
            if let Err(err) = self.persist(self.epoch, epoch) {
                error!(?err, epoch, "failed to persist wish");
                self.schedule_retry(epoch);
                return;
            }
            self.highest_wish = epoch;
            self.wishes[self.me as usize] = epoch;
            self.metrics.wish.set(epoch as i64);
            debug!(epoch, "wishing for new epoch");
        }
        self.broadcast_wish(sender).await;
    }

    /// The highest epoch that at least `count` oracles wish for (or beyond).
    fn supported(&self, count: usize) -> Epoch {
        let mut wishes = self.wishes.clone();
        wishes.sort_unstable_by(|a, b| b.cmp(a));
        count
            .checked_sub(1)
            .and_then(|index| wishes.get(index))
            .copied()
            .unwrap_or(0)
    }

    /// React to a change in the wishes of other oracles.
    async fn evaluate<S: Sender>(&mut self, sender: &mut S, outcome: &mut outcome::Mailbox) {
        // Some honest oracle wants at least this epoch
        let amplified = self.supported(self.shared.f as usize + 1);
        if amplified > self.highest_wish {
            self.wish(sender, amplified).await;
        }

        let agreed = self.supported(self.shared.quorum());
        if agreed <= self.epoch {
            return;
        }
        let highest_wish = self.highest_wish.max(agreed);
        if let Err(err) = self.persist(agreed, highest_wish) {
            error!(?err, epoch = agreed, "failed to persist epoch");
            self.schedule_retry(0);
            return;
        }
        self.epoch = agreed;
        self.highest_wish = highest_wish;
        self.metrics.epochs.inc();
        self.metrics.epoch.set(agreed as i64);
        let leader = self.shared.leader(agreed);
        info!(epoch = agreed, leader, "entering epoch");
        outcome.start_epoch(agreed, leader).await;
        self.progress_deadline = Some(Instant::now() + self.shared.delta_progress);
        if self.highest_wish <= self.epoch {
            self.resend_deadline = None;
        }
    }
}
