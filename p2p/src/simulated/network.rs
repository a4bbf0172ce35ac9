//! Implementation of a `simulated` network.

use super::{metrics, Error};
use crate::{Channel, Message, Recipients};
use bytes::Bytes;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt, StreamExt,
};
use ocr_utils::OracleId;
use prometheus_client::{
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing::{debug, trace};

type Task = (
    Channel,
    OracleId,
    Recipients,
    Bytes,
    oneshot::Sender<Vec<OracleId>>,
);

enum Command {
    Register {
        oracle: OracleId,
        channel: Channel,
        max_size: usize,
        result: oneshot::Sender<Result<mpsc::UnboundedReceiver<Message>, Error>>,
    },
    AddLink {
        sender: OracleId,
        receiver: OracleId,
        link: Link,
        result: oneshot::Sender<Result<(), Error>>,
    },
    RemoveLink {
        sender: OracleId,
        receiver: OracleId,
        result: oneshot::Sender<()>,
    },
    Block {
        blocker: OracleId,
        blocked: OracleId,
        result: oneshot::Sender<()>,
    },
}

/// Describes a connection between two oracles.
///
/// Links are unidirectional (and must be set up in both directions
/// for a bidirectional connection).
#[derive(Clone, Debug)]
pub struct Link {
    /// Mean latency for the delivery of a message.
    pub latency: Duration,

    /// Standard deviation of the latency for the delivery of a message.
    pub jitter: Duration,

    /// Probability of a message being delivered successfully (in range [0,1]).
    pub success_rate: f64,
}

impl Link {
    /// A lossless link without latency.
    pub fn instant() -> Self {
        Self {
            latency: Duration::ZERO,
            jitter: Duration::ZERO,
            success_rate: 1.0,
        }
    }
}

/// Configuration for a `simulated` network.
pub struct Config {
    /// Registry for network metrics.
    pub registry: Arc<Mutex<Registry>>,

    /// Seed for link failures and latency sampling.
    pub seed: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            seed: 0,
        }
    }
}

/// Implementation of a `simulated` network.
pub struct Network {
    rng: StdRng,
    tasks: mpsc::UnboundedReceiver<Task>,
    commands: mpsc::UnboundedReceiver<Command>,

    links: HashMap<(OracleId, OracleId), Link>,
    blocked: HashSet<(OracleId, OracleId)>,
    agents: BTreeMap<OracleId, HashMap<Channel, (usize, mpsc::UnboundedSender<Message>)>>,

    received_messages: Family<metrics::Message, Counter>,
    sent_messages: Family<metrics::Message, Counter>,
}

impl Network {
    /// Create a new simulated network and a handle for configuring it.
    pub fn new(cfg: Config) -> (Self, Oracle) {
        let (task_sender, tasks) = mpsc::unbounded();
        let (command_sender, commands) = mpsc::unbounded();
        let sent_messages = Family::<metrics::Message, Counter>::default();
        let received_messages = Family::<metrics::Message, Counter>::default();
        {
            let mut registry = cfg.registry.lock().unwrap();
            registry.register("messages_sent", "messages sent", sent_messages.clone());
            registry.register(
                "messages_received",
                "messages received",
                received_messages.clone(),
            );
        }

        let network = Self {
            rng: StdRng::seed_from_u64(cfg.seed),
            tasks,
            commands,
            links: HashMap::new(),
            blocked: HashSet::new(),
            agents: BTreeMap::new(),
            received_messages,
            sent_messages,
        };
        let oracle = Oracle {
            commands: command_sender,
            tasks: task_sender,
        };
        (network, oracle)
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Register {
                oracle,
                channel,
                max_size,
                result,
            } => {
                let entry = self.agents.entry(oracle).or_default();
                if entry.contains_key(&channel) {
                    let _ = result.send(Err(Error::ChannelAlreadyRegistered(channel)));
                    return;
                }
                let (sender, receiver) = mpsc::unbounded();
                entry.insert(channel, (max_size, sender));
                let _ = result.send(Ok(receiver));
            }
            Command::AddLink {
                sender,
                receiver,
                link,
                result,
            } => {
                if sender == receiver {
                    let _ = result.send(Err(Error::LinkingSelf));
                    return;
                }
                if !(0.0..=1.0).contains(&link.success_rate) {
                    let _ = result.send(Err(Error::InvalidSuccessRate(link.success_rate)));
                    return;
                }
                self.links.insert((sender, receiver), link);
                let _ = result.send(Ok(()));
            }
            Command::RemoveLink {
                sender,
                receiver,
                result,
            } => {
                self.links.remove(&(sender, receiver));
                let _ = result.send(());
            }
            Command::Block {
                blocker,
                blocked,
                result,
            } => {
                debug!(blocker, blocked, "blocking oracle");
                self.blocked.insert((blocker, blocked));
                let _ = result.send(());
            }
        }
    }

    fn lookup(
        &self,
        channel: Channel,
        recipient: OracleId,
        len: usize,
    ) -> Option<mpsc::UnboundedSender<Message>> {
        let Some((max_size, sender)) = self
            .agents
            .get(&recipient)
            .and_then(|channels| channels.get(&channel))
        else {
            debug!(recipient, channel, reason = "missing channel", "dropping message");
            return None;
        };
        if len > *max_size {
            debug!(
                recipient,
                channel,
                size = len,
                max_size = *max_size,
                reason = "message too large",
                "dropping message",
            );
            return None;
        }
        Some(sender.clone())
    }

    fn handle_task(&mut self, task: Task) {
        let (channel, origin, recipients, message, reply) = task;
        let recipients = match recipients {
            Recipients::All => self.agents.keys().copied().collect(),
            Recipients::Some(oracles) => oracles,
            Recipients::One(oracle) => vec![oracle],
        };

        let mut sent = Vec::new();
        for recipient in recipients {
            if self.blocked.contains(&(recipient, origin)) {
                trace!(origin, recipient, reason = "blocked", "dropping message");
                continue;
            }
            let Some(mut sender) = self.lookup(channel, recipient, message.len()) else {
                continue;
            };
            let label = metrics::Message::new(origin, recipient, channel);

            // Loopback is always instant and lossless.
            if recipient == origin {
                if sender.unbounded_send((origin, message.clone())).is_ok() {
                    self.received_messages.get_or_create(&label).inc();
                }
                sent.push(recipient);
                continue;
            }

            let Some(link) = self.links.get(&(origin, recipient)) else {
                trace!(origin, recipient, reason = "no link", "dropping message");
                continue;
            };
            self.sent_messages.get_or_create(&label).inc();
            sent.push(recipient);

            if !self.rng.gen_bool(link.success_rate) {
                trace!(origin, recipient, reason = "random link failure", "dropping message");
                continue;
            }
            let mean = link.latency.as_secs_f64() * 1000.0;
            let stddev = link.jitter.as_secs_f64() * 1000.0;
            let delay = Normal::new(mean, stddev)
                .map(|normal| normal.sample(&mut self.rng))
                .unwrap_or(mean)
                .max(0.0);
            if delay == 0.0 {
                if sender.unbounded_send((origin, message.clone())).is_ok() {
                    self.received_messages.get_or_create(&label).inc();
                }
                continue;
            }

            // Messages may be reordered when latency varies.
            let received_messages = self.received_messages.clone();
            let message = message.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_micros((delay * 1000.0) as u64)).await;
                if let Err(err) = sender.send((origin, message)).await {
                    trace!(origin, recipient, ?err, "recipient exited");
                    return;
                }
                received_messages.get_or_create(&label).inc();
            });
        }

        if reply.send(sent).is_err() {
            trace!(origin, "sender exited before ack");
        }
    }

    /// Run the simulated network until every [Oracle] handle and [Sender] is dropped.
    pub async fn run(mut self) {
        let mut commands_open = true;
        loop {
            tokio::select! {
                biased;
                command = self.commands.next(), if commands_open => {
                    match command {
                        Some(command) => self.handle_command(command),
                        None => commands_open = false,
                    }
                },
                task = self.tasks.next() => {
                    let Some(task) = task else {
                        break;
                    };
                    self.handle_task(task);
                },
            }
        }
        debug!("simulated network shutdown");
    }
}

/// Handle for registering oracles and changing links while the network runs.
#[derive(Clone)]
pub struct Oracle {
    commands: mpsc::UnboundedSender<Command>,
    tasks: mpsc::UnboundedSender<Task>,
}

impl Oracle {
    /// Register `oracle` on `channel`, rejecting messages larger than `max_size`.
    pub async fn register(
        &mut self,
        oracle: OracleId,
        channel: Channel,
        max_size: usize,
    ) -> Result<(Sender, Receiver), Error> {
        let (result, response) = oneshot::channel();
        self.commands
            .send(Command::Register {
                oracle,
                channel,
                max_size,
                result,
            })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        let receiver = response.await.map_err(|_| Error::NetworkClosed)??;
        Ok((
            Sender {
                channel,
                max_size,
                me: oracle,
                tasks: self.tasks.clone(),
            },
            Receiver { receiver },
        ))
    }

    /// Create (or replace) a unidirectional link.
    pub async fn add_link(
        &mut self,
        sender: OracleId,
        receiver: OracleId,
        link: Link,
    ) -> Result<(), Error> {
        let (result, response) = oneshot::channel();
        self.commands
            .send(Command::AddLink {
                sender,
                receiver,
                link,
                result,
            })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        response.await.map_err(|_| Error::NetworkClosed)?
    }

    /// Remove a unidirectional link, dropping all future traffic over it.
    pub async fn remove_link(&mut self, sender: OracleId, receiver: OracleId) -> Result<(), Error> {
        let (result, response) = oneshot::channel();
        self.commands
            .send(Command::RemoveLink {
                sender,
                receiver,
                result,
            })
            .await
            .map_err(|_| Error::NetworkClosed)?;
        response.await.map_err(|_| Error::NetworkClosed)
    }

    /// Get a [crate::Blocker] acting on behalf of `me`.
    pub fn control(&self, me: OracleId) -> Control {
        Control {
            me,
            commands: self.commands.clone(),
        }
    }
}

/// Per-oracle [crate::Blocker] for the simulated network.
#[derive(Clone)]
pub struct Control {
    me: OracleId,
    commands: mpsc::UnboundedSender<Command>,
}

impl crate::Blocker for Control {
    async fn block(&mut self, peer: OracleId) {
        let (result, response) = oneshot::channel();
        if self
            .commands
            .send(Command::Block {
                blocker: self.me,
                blocked: peer,
                result,
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = response.await;
    }
}

/// Implementation of a [crate::Sender] for the simulated network.
#[derive(Clone, Debug)]
pub struct Sender {
    channel: Channel,
    max_size: usize,
    me: OracleId,
    tasks: mpsc::UnboundedSender<Task>,
}

impl crate::Sender for Sender {
    type Error = Error;

    async fn send(
        &mut self,
        recipients: Recipients,
        message: Bytes,
        priority: bool,
    ) -> Result<Vec<OracleId>, Error> {
        if message.len() > self.max_size {
            return Err(Error::MessageTooLarge(message.len()));
        }
        trace!(me = self.me, channel = self.channel, priority, "sending message");
        let (reply, response) = oneshot::channel();
        self.tasks
            .unbounded_send((self.channel, self.me, recipients, message, reply))
            .map_err(|_| Error::NetworkClosed)?;
        response.await.map_err(|_| Error::NetworkClosed)
    }
}

/// Implementation of a [crate::Receiver] for the simulated network.
#[derive(Debug)]
pub struct Receiver {
    receiver: mpsc::UnboundedReceiver<Message>,
}

impl crate::Receiver for Receiver {
    type Error = Error;

    async fn recv(&mut self) -> Result<Message, Error> {
        self.receiver.next().await.ok_or(Error::NetworkClosed)
    }
}
