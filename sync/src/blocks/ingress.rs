use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use ocr_consensus::{types::AttestedStateTransitionBlock, Reporter};
use ocr_utils::SeqNr;
use tracing::error;

/// Message types that can be sent to the `Mailbox`
pub enum Message {
    /// A block at `seq_nr` was persisted, possibly ahead of the committed state.
    Persisted { seq_nr: SeqNr },

    /// The committee committed `seq_nr` but earlier blocks are missing.
    Behind { seq_nr: SeqNr },

    /// The committed state reached `seq_nr`.
    Committed { seq_nr: SeqNr },

    /// Fetch the attested block at `seq_nr` from peers without persisting it.
    Fetch {
        seq_nr: SeqNr,
        responder: oneshot::Sender<AttestedStateTransitionBlock>,
    },

    /// The store was replaced by tree-sync.
    Resume,
}

/// Ingress mailbox for [`Actor`](super::Actor).
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    async fn send(&mut self, message: Message) {
        if let Err(err) = self.sender.send(message).await {
            error!(?err, "failed to send to block persistence");
        }
    }

    /// Resolves once some peer served a valid attested block at `seq_nr`, or with `None` if
    /// block persistence stopped.
    pub async fn fetch(&mut self, seq_nr: SeqNr) -> Option<AttestedStateTransitionBlock> {
        let (responder, receiver) = oneshot::channel();
        self.send(Message::Fetch { seq_nr, responder }).await;
        receiver.await.ok()
    }

    pub async fn resume(&mut self) {
        self.send(Message::Resume).await;
    }
}

impl Reporter for Mailbox {
    async fn persisted(&mut self, seq_nr: SeqNr) {
        self.send(Message::Persisted { seq_nr }).await;
    }

    async fn behind(&mut self, seq_nr: SeqNr) {
        self.send(Message::Behind { seq_nr }).await;
    }

    async fn committed(&mut self, seq_nr: SeqNr) {
        self.send(Message::Committed { seq_nr }).await;
    }
}
