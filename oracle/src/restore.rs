use crate::Error;
use ocr_consensus::{
    state::{self, Committed, PacemakerState},
    types::CertifiedPrepareOrCommit,
    SharedConfig,
};
use ocr_storage::kv::Database;
use ocr_sync::tree::{read_status, TreeSyncStatus};
use ocr_utils::SeqNr;
use std::time::Duration;
use tracing::{error, warn};

/// Durable state an oracle resumes from.
#[derive(Clone, Debug)]
pub struct Restored {
    pub pacemaker: PacemakerState,
    pub committed: Committed,
    pub highest_certified: CertifiedPrepareOrCommit,
    pub tree_sync: TreeSyncStatus,

    /// Lowest and highest persisted block, if any.
    pub persisted: Option<(SeqNr, SeqNr)>,
}

impl Restored {
    /// Read every component's durable state from one snapshot of `db`.
    pub fn load(db: &Database, shared: &SharedConfig) -> Result<Self, Error> {
        let txn = db.read_transaction();
        Ok(Self {
            pacemaker: state::read_pacemaker_state(&txn)?,
            committed: state::read_committed(&txn)?,
            highest_certified: state::read_highest_certified(&txn, &shared.limits)?,
            tree_sync: read_status(&txn)?,
            persisted: state::persisted_range(&txn)?,
        })
    }
}

/// Run `attempt` until it succeeds, sleeping between failures for `initial`, doubled after every
/// failure up to `max`. Gives up after `attempts` failures.
pub(crate) async fn with_backoff<T>(
    attempts: usize,
    initial: Duration,
    max: Duration,
    mut attempt: impl FnMut() -> Result<T, Error>,
) -> Result<T, Error> {
    let attempts = attempts.max(1);
    let mut backoff = initial;
    let mut failures = 0;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(err) => {
                failures += 1;
                if failures >= attempts {
                    error!(?err, attempts, "giving up");
                    return Err(Error::Restore {
                        attempts,
                        source: Box::new(err),
                    });
                }
                warn!(?err, failures, ?backoff, "attempt failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2).min(max);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocr_consensus::mocks::certified_chain;
    use ocr_consensus::types::WriteSet;
    use ocr_cryptography::PrivateKey;
    use ocr_utils::ConfigDigest;
    use std::collections::BTreeMap;
    use test_case::test_case;
    use tokio::time::Instant;

    fn failure() -> Error {
        Error::Consensus(ocr_consensus::Error::InvalidConfig("unavailable"))
    }

    #[test_case(1, 0; "first attempt")]
    #[test_case(2, 1; "one retry")]
    #[test_case(4, 6; "capped backoff")]
    #[tokio::test(start_paused = true)]
    async fn test_backoff_until_success(succeeds_on: usize, elapsed_secs: u64) {
        let start = Instant::now();
        let mut calls = 0;
        let value = with_backoff(5, Duration::from_secs(1), Duration::from_secs(3), || {
            calls += 1;
            if calls < succeeds_on {
                Err(failure())
            } else {
                Ok(calls)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, succeeds_on);

        // Waits 1s, 2s, then at most 3s between attempts
        assert_eq!(start.elapsed(), Duration::from_secs(elapsed_secs));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_gives_up() {
        let start = Instant::now();
        let mut calls = 0;
        let result: Result<(), _> =
            with_backoff(3, Duration::from_millis(100), Duration::from_secs(1), || {
                calls += 1;
                Err(failure())
            })
            .await;
        assert!(matches!(result, Err(Error::Restore { attempts: 3, .. })));
        assert_eq!(calls, 3);
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn test_load_committed_chain() {
        let signers: Vec<_> = (0..4).map(PrivateKey::from_seed).collect();
        let config_digest = ConfigDigest([5u8; 32]);
        let shared = SharedConfig::new(
            config_digest,
            signers.iter().map(|s| s.public_key()).collect(),
            1,
        );
        let db = Database::new();
        certified_chain(&db, &config_digest, &signers, 12, |_| {
            WriteSet::new(BTreeMap::new())
        })
        .unwrap();

        let restored = Restored::load(&db, &shared).unwrap();
        assert_eq!(restored.committed.seq_nr, 12);
        assert_eq!(restored.persisted, Some((1, 12)));
        assert_eq!(restored.tree_sync, TreeSyncStatus::default());
    }

    #[test]
    fn test_load_empty_store() {
        let shared = SharedConfig::new(
            ConfigDigest([5u8; 32]),
            vec![PrivateKey::from_seed(0).public_key()],
            0,
        );
        let restored = Restored::load(&Database::new(), &shared).unwrap();
        assert_eq!(restored.committed, Committed::default());
        assert_eq!(restored.pacemaker, PacemakerState::default());
        assert_eq!(restored.highest_certified, CertifiedPrepareOrCommit::Genesis);
        assert_eq!(restored.persisted, None);
    }
}
