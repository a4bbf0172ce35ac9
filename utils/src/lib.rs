//! Leverage common functionality across the reporting protocol.

use ocr_codec::varint;

mod ids;
pub use ids::{ConfigDigest, Epoch, OracleId, Round, SeqNr};
mod priority_set;
pub use priority_set::PrioritySet;
mod scheduler;
pub use scheduler::{earliest, sleep_until, Scheduler};

/// Converts bytes to a hexadecimal string.
pub fn hex(bytes: &[u8]) -> String {
    let mut hex = String::with_capacity(bytes.len() * 2);
    for byte in bytes.iter() {
        hex.push_str(&format!("{:02x}", byte));
    }
    hex
}

/// Converts a hexadecimal string to bytes.
pub fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}

/// Compute the largest number of faults `f` tolerated by a committee of `n` oracles (`n > 3f`).
///
/// Returns `None` if the committee cannot tolerate any faults.
pub fn max_faults(n: u32) -> Option<u32> {
    let f = n.checked_sub(1)? / 3;
    if f == 0 {
        return None;
    }
    Some(f)
}

/// Minimum number of oracles such that any two such sets intersect in at least one honest oracle,
/// given `n` oracles of which at most `f` are faulty.
///
/// This is `floor((n + f) / 2) + 1`, which equals `2f + 1` when `n = 3f + 1`.
pub fn byzantine_quorum(n: u32, f: u32) -> u32 {
    (n + f) / 2 + 1
}

/// Prefix `msg` with the varint length of `namespace` and `namespace` itself.
///
/// Used to domain-separate signatures so a signature over one message kind can never be
/// replayed as another.
pub fn union_unique(namespace: &[u8], msg: &[u8]) -> Vec<u8> {
    let mut result =
        Vec::with_capacity(varint::len_size(namespace.len()) + namespace.len() + msg.len());
    varint::write_len(namespace.len(), &mut result);
    result.extend_from_slice(namespace);
    result.extend_from_slice(msg);
    result
}

/// Interpret `bytes` as a big-endian integer and reduce it modulo `n`.
pub fn modulo(bytes: &[u8], n: u64) -> u64 {
    let mut result = 0u64;
    for &byte in bytes {
        result = ((u128::from(result) << 8 | u128::from(byte)) % u128::from(n)) as u64;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_hex() {
        let b = &[0x01, 0x02, 0xab];
        assert_eq!(hex(b), "0102ab");
        assert_eq!(from_hex("0102ab").unwrap(), b.to_vec());
        assert!(from_hex("0102a").is_none());
        assert!(from_hex("zz").is_none());
    }

    #[test_case(3, None)]
    #[test_case(4, Some(1))]
    #[test_case(7, Some(2))]
    #[test_case(10, Some(3))]
    fn test_max_faults(n: u32, expected: Option<u32>) {
        assert_eq!(max_faults(n), expected);
    }

    #[test_case(4, 1, 3)]
    #[test_case(5, 1, 4)]
    #[test_case(7, 2, 5)]
    #[test_case(10, 3, 7)]
    fn test_byzantine_quorum(n: u32, f: u32, expected: u32) {
        assert_eq!(byzantine_quorum(n, f), expected);
    }

    #[test]
    fn test_union_unique() {
        let namespace = b"namespace";
        let msg = b"message";
        let result = union_unique(namespace, msg);
        assert_eq!(result[0] as usize, namespace.len());
        assert_eq!(&result[1..10], namespace);
        assert_eq!(&result[10..], msg);
        assert_ne!(union_unique(b"a", b"bc"), union_unique(b"ab", b"c"));
    }

    #[test]
    fn test_modulo() {
        assert_eq!(modulo(&[0x01, 0x00], 7), 256 % 7);
        assert_eq!(modulo(&[0xff; 32], 1), 0);
        assert_eq!(modulo(&[], 5), 0);
    }
}
