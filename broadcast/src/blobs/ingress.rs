use super::LightCertifiedBlob;
use crate::{BlobBroadcaster, BlobFetcher, Error};
use bytes::Bytes;
use futures::{
    channel::{mpsc, oneshot},
    SinkExt,
};
use ocr_utils::SeqNr;

/// Message types that can be sent to the `Mailbox`
pub enum Message {
    Broadcast {
        payload: Bytes,
        expiry_seq_nr: SeqNr,
        responder: oneshot::Sender<Result<LightCertifiedBlob, Error>>,
    },
    Fetch {
        certificate: LightCertifiedBlob,
        responder: oneshot::Sender<Result<Bytes, Error>>,
    },
    Committed {
        seq_nr: SeqNr,
    },
}

/// Ingress mailbox for [`Engine`](super::Engine).
#[derive(Clone)]
pub struct Mailbox {
    sender: mpsc::Sender<Message>,
}

impl Mailbox {
    pub(super) fn new(sender: mpsc::Sender<Message>) -> Self {
        Self { sender }
    }

    /// Discard blobs that expire at or before `seq_nr`.
    pub async fn committed(&mut self, seq_nr: SeqNr) {
        let _ = self.sender.send(Message::Committed { seq_nr }).await;
    }
}

impl BlobBroadcaster for Mailbox {
    async fn broadcast_blob(
        &self,
        payload: Bytes,
        expiry_seq_nr: SeqNr,
    ) -> Result<LightCertifiedBlob, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .clone()
            .send(Message::Broadcast {
                payload,
                expiry_seq_nr,
                responder,
            })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }
}

impl BlobFetcher for Mailbox {
    async fn fetch_blob(&self, certificate: LightCertifiedBlob) -> Result<Bytes, Error> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .clone()
            .send(Message::Fetch {
                certificate,
                responder,
            })
            .await
            .map_err(|_| Error::Closed)?;
        receiver.await.map_err(|_| Error::Closed)?
    }
}
