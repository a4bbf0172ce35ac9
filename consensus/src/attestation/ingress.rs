use bytes::Bytes;
use futures::{channel::mpsc, SinkExt};
use ocr_utils::SeqNr;
use tracing::error;

/// Message types that can be sent to the `Mailbox`
#[derive(Debug, PartialEq, Eq)]
pub enum Message {
    /// The block at `seq_nr` was committed and applied.
    Committed {
        seq_nr: SeqNr,
        reports_plus_precursor: Bytes,
    },
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

    pub async fn committed(&mut self, seq_nr: SeqNr, reports_plus_precursor: Bytes) {
        if let Err(err) = self
            .sender
            .send(Message::Committed {
                seq_nr,
                reports_plus_precursor,
            })
            .await
        {
            error!(?err, "failed to send committed to attestation");
        }
    }
}
