use ocr_broadcast::blobs;
use ocr_consensus::Reporter;
use ocr_sync::blocks;
use ocr_utils::SeqNr;

/// Forwards progress from outcome generation to block persistence and blob exchange.
#[derive(Clone)]
pub struct Outcome {
    pub blocks: blocks::Mailbox,
    pub blobs: blobs::Mailbox,
}

impl Reporter for Outcome {
    async fn persisted(&mut self, seq_nr: SeqNr) {
        self.blocks.persisted(seq_nr).await;
    }

    async fn behind(&mut self, seq_nr: SeqNr) {
        self.blocks.behind(seq_nr).await;
    }

    async fn committed(&mut self, seq_nr: SeqNr) {
        self.blocks.committed(seq_nr).await;
        self.blobs.committed(seq_nr).await;
    }
}

/// Reaps blobs that expired at a sequence number committed through replay or tree-sync.
#[derive(Clone)]
pub struct Reaping {
    pub blobs: blobs::Mailbox,
}

impl Reporter for Reaping {
    async fn persisted(&mut self, _: SeqNr) {}

    async fn behind(&mut self, _: SeqNr) {}

    async fn committed(&mut self, seq_nr: SeqNr) {
        self.blobs.committed(seq_nr).await;
    }
}
