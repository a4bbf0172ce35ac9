//! Which oracles transmit a report, and when.

use ocr_cryptography::{hmac::hmac_sha256, Sha256};
use ocr_utils::{modulo, OracleId, SeqNr};
use std::time::Duration;

/// A pseudo-random order of the committee for the report at (`seq_nr`, `index`).
///
/// Returns, for each oracle, its position in the order. Every oracle sharing `key` derives the
/// same order, while outsiders cannot predict it.
pub fn permutation(key: &[u8; 32], seq_nr: SeqNr, index: u32, n: usize) -> Vec<usize> {
    let mut message = Vec::with_capacity(12);
    message.extend_from_slice(&seq_nr.to_be_bytes());
    message.extend_from_slice(&index.to_be_bytes());
    let seed = hmac_sha256(key, &message);

    // Fisher-Yates, drawing each swap from the seed
    let mut order: Vec<usize> = (0..n).collect();
    for i in (1..n).rev() {
        let draw = Sha256::new()
            .update(&seed)
            .update(&(i as u64).to_be_bytes())
            .finalize();
        let j = modulo(&draw, i as u64 + 1) as usize;
        order.swap(i, j);
    }

    let mut positions = vec![0; n];
    for (position, oracle) in order.into_iter().enumerate() {
        positions[oracle] = position;
    }
    positions
}

/// The stage of the transmission schedule that `position` falls into, if any.
pub fn stage(schedule: &[usize], position: usize) -> Option<usize> {
    let mut end = 0;
    for (stage, size) in schedule.iter().enumerate() {
        end += size;
        if position < end {
            return Some(stage);
        }
    }
    None
}

/// How long `oracle` waits before transmitting the report at (`seq_nr`, `index`).
///
/// Returns `None` if the oracle is not scheduled to transmit it at all.
pub fn delay(
    key: &[u8; 32],
    schedule: &[usize],
    delta_stage: Duration,
    seq_nr: SeqNr,
    index: u32,
    n: usize,
    oracle: OracleId,
) -> Option<Duration> {
    let position = *permutation(key, seq_nr, index, n).get(oracle as usize)?;
    let stage = stage(schedule, position)?;
    Some(delta_stage * stage as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use test_case::test_case;

    const KEY: [u8; 32] = [7u8; 32];

    #[test_case(1)]
    #[test_case(4)]
    #[test_case(7)]
    #[test_case(31)]
    fn test_permutation_is_bijection(n: usize) {
        for seq_nr in 0..20 {
            let positions = permutation(&KEY, seq_nr, 0, n);
            let distinct: BTreeSet<_> = positions.iter().copied().collect();
            assert_eq!(distinct.len(), n);
            assert!(positions.iter().all(|p| *p < n));
        }
    }

    #[test]
    fn test_permutation_deterministic() {
        assert_eq!(permutation(&KEY, 5, 1, 10), permutation(&KEY, 5, 1, 10));
        assert_ne!(permutation(&KEY, 5, 1, 10), permutation(&[8u8; 32], 5, 1, 10));

        // Different reports see different orders
        let orders: BTreeSet<_> = (0..16).map(|seq_nr| permutation(&KEY, seq_nr, 0, 10)).collect();
        assert!(orders.len() > 1);
    }

    #[test_case(0, Some(0))]
    #[test_case(1, Some(1))]
    #[test_case(2, Some(2))]
    #[test_case(3, Some(2))]
    #[test_case(4, None)]
    fn test_stage(position: usize, expected: Option<usize>) {
        assert_eq!(stage(&[1, 1, 2], position), expected);
    }

    #[test]
    fn test_delay_covers_schedule() {
        let n = 7;
        let delta = Duration::from_secs(5);
        let delays: Vec<_> = (0..n as OracleId)
            .map(|oracle| delay(&KEY, &[1, 1, 2], delta, 3, 0, n, oracle))
            .collect();
        assert_eq!(delays.iter().filter(|d| **d == Some(Duration::ZERO)).count(), 1);
        assert_eq!(delays.iter().filter(|d| **d == Some(delta)).count(), 1);
        assert_eq!(delays.iter().filter(|d| **d == Some(delta * 2)).count(), 2);
        assert_eq!(delays.iter().filter(|d| d.is_none()).count(), 3);
    }
}
