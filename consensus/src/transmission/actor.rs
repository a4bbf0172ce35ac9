use super::{
    ingress::{Mailbox, Message},
    metrics::Metrics,
    schedule, Config,
};
use crate::{
    plugin::{bounded, ContractTransmitter, Plugin, PluginError},
    types::AttestedReport,
    SharedConfig,
};
use futures::{channel::mpsc, StreamExt};
use ocr_utils::{sleep_until, OracleId, Scheduler, SeqNr};
use std::{collections::BTreeSet, time::Duration};
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

enum Outcome {
    Accepted {
        report: AttestedReport,
        delay: Duration,
        result: Result<bool, PluginError>,
    },
    Transmitted {
        seq_nr: SeqNr,
        index: u32,
        result: Result<bool, PluginError>,
    },
}

/// Transmits attested reports according to the committee's staggered schedule.
pub struct Actor<P: Plugin, T: ContractTransmitter> {
    me: OracleId,
    shared: SharedConfig,
    window: u64,

    plugin: P,
    transmitter: T,
    mailbox_receiver: mpsc::Receiver<Message>,
    outcomes: mpsc::UnboundedSender<Outcome>,
    outcomes_receiver: mpsc::UnboundedReceiver<Outcome>,

    /// Reports already seen, by sequence number and index.
    seen: BTreeSet<(SeqNr, u32)>,
    scheduler: Scheduler<AttestedReport>,

    metrics: Metrics,
}

impl<P: Plugin, T: ContractTransmitter> Actor<P, T> {
    pub fn new(cfg: Config<P, T>) -> (Self, Mailbox) {
        let (sender, mailbox_receiver) = mpsc::channel(cfg.mailbox_size);
        let (outcomes, outcomes_receiver) = mpsc::unbounded();
        let metrics = Metrics::init(&cfg.registry);
        (
            Self {
                me: cfg.me,
                shared: cfg.shared,
                window: cfg.window,

                plugin: cfg.plugin,
                transmitter: cfg.transmitter,
                mailbox_receiver,
                outcomes,
                outcomes_receiver,

                seen: BTreeSet::new(),
                scheduler: Scheduler::new(),

                metrics,
            },
            Mailbox::new(sender),
        )
    }

    /// Spawn report transmission on the current runtime.
    pub fn start(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    async fn run(mut self, cancel: CancellationToken) {
        loop {
            let deadline = self.scheduler.next_deadline();
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("shutdown");
                    return;
                },

                mail = self.mailbox_receiver.next() => {
                    let Some(Message::Attested(report)) = mail else {
                        debug!("mailbox closed");
                        return;
                    };
                    self.handle_attested(report);
                },

                Some(outcome) = self.outcomes_receiver.next() => {
                    self.handle_outcome(outcome);
                },

                _ = sleep_until(deadline) => {
                    for report in self.scheduler.pop_expired(Instant::now()) {
                        self.transmit(report);
                    }
                },
            }
        }
    }

    fn handle_attested(&mut self, report: AttestedReport) {
        let highest = self.seen.last().map(|(seq_nr, _)| *seq_nr).unwrap_or(0);
        if report.seq_nr + self.window < highest
            || !self.seen.insert((report.seq_nr, report.index))
        {
            return;
        }
        let oldest = highest.max(report.seq_nr).saturating_sub(self.window);
        self.seen = self.seen.split_off(&(oldest, 0));

        let Some(delay) = schedule::delay(
            &self.shared.transmission_order_key,
            &self.shared.transmission_schedule,
            self.shared.delta_stage,
            report.seq_nr,
            report.index,
            self.shared.n(),
            self.me,
        ) else {
            trace!(seq_nr = report.seq_nr, index = report.index, "not scheduled to transmit");
            self.metrics.skipped.inc();
            return;
        };

        let plugin = self.plugin.clone();
        let timeout = self.shared.timeouts.should_accept_attested_report;
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            let result = bounded(
                timeout,
                plugin.should_accept_attested_report(report.seq_nr, &report.report),
            )
            .await;
            let _ = outcomes.unbounded_send(Outcome::Accepted {
                report,
                delay,
                result,
            });
        });
    }

    fn transmit(&mut self, report: AttestedReport) {
        let plugin = self.plugin.clone();
        let transmitter = self.transmitter.clone();
        let timeout = self.shared.timeouts.should_transmit_accepted_report;
        let config_digest = self.shared.config_digest;
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            let (seq_nr, index) = (report.seq_nr, report.index);
            let result: Result<bool, PluginError> = async {
                if !bounded(
                    timeout,
                    plugin.should_transmit_accepted_report(seq_nr, &report.report),
                )
                .await?
                {
                    return Ok(false);
                }
                transmitter.transmit(config_digest, report).await?;
                Ok(true)
            }
            .await;
            let _ = outcomes.unbounded_send(Outcome::Transmitted {
                seq_nr,
                index,
                result,
            });
        });
    }

    fn handle_outcome(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Accepted {
                report,
                delay,
                result,
            } => match result {
                Ok(true) => {
                    debug!(
                        seq_nr = report.seq_nr,
                        index = report.index,
                        ?delay,
                        "scheduled transmission"
                    );
                    self.metrics.scheduled.inc();
                    self.scheduler.schedule(Instant::now() + delay, report);
                }
                Ok(false) => {
                    self.metrics.skipped.inc();
                }
                Err(err) => {
                    warn!(?err, seq_nr = report.seq_nr, "failed to accept report");
                    self.metrics.failed.inc();
                }
            },
            Outcome::Transmitted {
                seq_nr,
                index,
                result,
            } => match result {
                Ok(true) => {
                    debug!(seq_nr, index, "transmitted");
                    self.metrics.transmitted.inc();
                }
                Ok(false) => {
                    self.metrics.skipped.inc();
                }
                Err(err) => {
                    warn!(?err, seq_nr, index, "failed to transmit");
                    self.metrics.failed.inc();
                }
            },
        }
    }
}
