use crate::types::AttestedReport;
use futures::{channel::mpsc, SinkExt};
use tracing::error;

/// Message types that can be sent to the `Mailbox`
#[derive(Debug)]
pub enum Message {
    Attested(AttestedReport),
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

    /// Schedule `report` for transmission.
    pub async fn attested(&mut self, report: AttestedReport) {
        if let Err(err) = self.sender.send(Message::Attested(report)).await {
            error!(?err, "failed to send attested report to transmission");
        }
    }
}
