use crate::Error;
use ocr_consensus::{plugin::Limits, state};
use ocr_storage::kv::{self, Database};
use ocr_utils::{ConfigDigest, SeqNr};
use tracing::trace;

/// Attempts per block when a concurrent commit invalidates the transaction.
const CONFLICT_RETRIES: usize = 3;

/// Apply persisted blocks that follow the committed one, strictly in order, until one is missing.
///
/// Each block is applied in its own transaction. Returns the new committed sequence number, or
/// `None` if no block was applied. Replaying an already replayed store applies nothing.
pub fn replay(
    db: &Database,
    config_digest: &ConfigDigest,
    limits: &Limits,
) -> Result<Option<SeqNr>, Error> {
    let mut applied = None;
    let mut conflicts = 0;
    loop {
        let mut txn = db.serialized_transaction();
        let committed = state::read_committed(&txn)?;
        let Some(block) = state::read_block(&txn, committed.seq_nr + 1, limits)? else {
            return Ok(applied);
        };
        state::apply_block(&mut txn, config_digest, &block.block)?;
        match txn.commit() {
            Ok(()) => {
                trace!(seq_nr = block.block.seq_nr, "replayed block");
                applied = Some(block.block.seq_nr);
                conflicts = 0;
            }
            Err(kv::Error::Conflict { .. }) if conflicts < CONFLICT_RETRIES => {
                conflicts += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
}
