use ocr_utils::{Epoch, OracleId};
use futures::{channel::mpsc, SinkExt};
use tracing::error;

/// Message types that can be sent to the `Mailbox`
#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    /// The pacemaker entered `epoch`, led by `leader`.
    StartEpoch { epoch: Epoch, leader: OracleId },
}

/// Ingress mailbox for [`Actor`](super::Actor).
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(crate) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    pub async fn start_epoch(&mut self, epoch: Epoch, leader: OracleId) {
        if let Err(err) = self.sender.send(Message::StartEpoch { epoch, leader }).await {
            error!(?err, "failed to send start epoch to outcome generation");
        }
    }
}
