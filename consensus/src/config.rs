use crate::{
    plugin::{Limits, Timeouts},
    types::MAX_ORACLES,
    Error,
};
use ocr_cryptography::{PublicKey, Sha256};
use ocr_utils::{byzantine_quorum, modulo, ConfigDigest, Epoch, OracleId};
use std::time::Duration;

/// Parameters every oracle in the committee must agree on.
#[derive(Clone, Debug)]
pub struct SharedConfig {
    pub config_digest: ConfigDigest,

    /// Public keys of the committee, indexed by [OracleId].
    pub oracles: Vec<PublicKey>,

    /// Maximum number of byzantine oracles.
    pub f: u32,

    /// How long to wait for a commit before asking for a new epoch.
    pub delta_progress: Duration,

    /// Interval between retransmissions of unanswered epoch messages.
    pub delta_resend: Duration,

    /// How long a new leader waits after starting an epoch before its first round.
    pub delta_initial: Duration,

    /// Minimum time between two rounds started by the same leader.
    pub delta_round: Duration,

    /// How long a leader keeps accepting observations after reaching a quorum.
    pub delta_grace: Duration,

    /// Minimum time between two requests for the same certified commit.
    pub delta_certified_commit_request: Duration,

    /// Delay between transmission stages.
    pub delta_stage: Duration,

    /// Rounds a leader drives before the epoch ends.
    pub rounds_per_epoch: u64,

    /// Number of oracles in each transmission stage. Oracles past the sum never transmit.
    pub transmission_schedule: Vec<usize>,

    /// Secret shared by the committee that seeds the transmission order.
    pub transmission_order_key: [u8; 32],

    pub limits: Limits,
    pub timeouts: Timeouts,

    /// Blocks between two state-tree snapshots that are retained for sync.
    pub snapshot_interval: u64,

    /// Leaves returned in a single tree-sync chunk.
    pub max_tree_sync_chunk_keys: usize,

    /// Bytes of keys and values returned in a single tree-sync chunk.
    pub max_tree_sync_chunk_bytes: usize,

    /// Blocks returned in a single block-sync response.
    pub max_blocks_per_response: usize,

    /// Interval between state-sync summaries.
    pub delta_state_sync_summary: Duration,

    /// Consecutive re-proposals whose replay disagrees with their certificate before outcome
    /// generation stops participating.
    pub max_consecutive_replay_mismatches: u32,
}

impl SharedConfig {
    /// A committee of `oracles` using defaults for every timing and limit.
    pub fn new(config_digest: ConfigDigest, oracles: Vec<PublicKey>, f: u32) -> Self {
        Self {
            config_digest,
            oracles,
            f,
            delta_progress: Duration::from_secs(8),
            delta_resend: Duration::from_secs(2),
            delta_initial: Duration::from_millis(500),
            delta_round: Duration::from_secs(1),
            delta_grace: Duration::from_millis(200),
            delta_certified_commit_request: Duration::from_secs(1),
            delta_stage: Duration::from_secs(5),
            rounds_per_epoch: 60,
            transmission_schedule: vec![1, 1, 2],
            transmission_order_key: [0u8; 32],
            limits: Limits::default(),
            timeouts: Timeouts::default(),
            snapshot_interval: 100,
            max_tree_sync_chunk_keys: 256,
            max_tree_sync_chunk_bytes: 1024 * 1024,
            max_blocks_per_response: 10,
            delta_state_sync_summary: Duration::from_secs(5),
            max_consecutive_replay_mismatches: 3,
        }
    }

    pub fn n(&self) -> usize {
        self.oracles.len()
    }

    /// Signatures needed for any certificate.
    pub fn quorum(&self) -> usize {
        byzantine_quorum(self.oracles.len() as u32, self.f) as usize
    }

    /// Leader of `epoch`.
    pub fn leader(&self, epoch: Epoch) -> OracleId {
        let digest = Sha256::new()
            .update(self.config_digest.as_bytes())
            .update(&epoch.to_be_bytes())
            .finalize();
        modulo(&digest, self.oracles.len() as u64) as OracleId
    }

    pub fn validate(&self) -> Result<(), Error> {
        let n = self.oracles.len();
        if n == 0 || n > MAX_ORACLES {
            return Err(Error::InvalidConfig("committee size"));
        }
        if n <= 3 * self.f as usize {
            return Err(Error::InvalidConfig("too many faults for committee size"));
        }
        if self.rounds_per_epoch == 0 {
            return Err(Error::InvalidConfig("rounds per epoch"));
        }
        if self.delta_progress <= self.delta_round {
            return Err(Error::InvalidConfig("progress timeout shorter than round"));
        }
        if self.snapshot_interval == 0 {
            return Err(Error::InvalidConfig("snapshot interval"));
        }
        if self.max_tree_sync_chunk_keys == 0 || self.max_blocks_per_response == 0 {
            return Err(Error::InvalidConfig("sync limits"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocr_cryptography::PrivateKey;
    use test_case::test_case;

    fn committee(n: u64, f: u32) -> SharedConfig {
        let oracles = (0..n).map(|i| PrivateKey::from_seed(i).public_key()).collect();
        SharedConfig::new(ConfigDigest([1u8; 32]), oracles, f)
    }

    #[test_case(4, 1, true)]
    #[test_case(3, 1, false)]
    #[test_case(7, 2, true)]
    #[test_case(7, 3, false)]
    fn test_validate(n: u64, f: u32, valid: bool) {
        assert_eq!(committee(n, f).validate().is_ok(), valid);
    }

    #[test]
    fn test_leader_deterministic() {
        let config = committee(4, 1);
        for epoch in 0..32 {
            let leader = config.leader(epoch);
            assert!((leader as usize) < config.n());
            assert_eq!(leader, committee(4, 1).leader(epoch));
        }
        let leaders: std::collections::BTreeSet<_> = (0..32).map(|e| config.leader(e)).collect();
        assert!(leaders.len() > 1);
    }
}
