use futures::{channel::mpsc, SinkExt};
use tracing::error;

/// Message types that can be sent to the `Mailbox`
pub enum Message {
    /// A block was committed in the current epoch.
    Progress,

    /// The current leader has finished its rounds.
    ChangeLeader,
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

    pub async fn progress(&mut self) {
        if let Err(err) = self.sender.send(Message::Progress).await {
            error!(?err, "failed to send progress to pacemaker");
        }
    }

    pub async fn change_leader(&mut self) {
        if let Err(err) = self.sender.send(Message::ChangeLeader).await {
            error!(?err, "failed to send change leader to pacemaker");
        }
    }
}
