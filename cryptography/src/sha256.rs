//! SHA-256 digests.
//!
//! # Example
//! ```rust
//! use ocr_cryptography::{hash, Sha256};
//!
//! let mut hasher = Sha256::new();
//! hasher.update(b"hello,");
//! hasher.update(b"world!");
//! assert_eq!(hasher.finalize(), hash(b"hello,world!"));
//! ```

use bytes::{Buf, BufMut};
use ocr_codec::{Error as CodecError, FixedSize, Read, Write};
use ocr_utils::hex;
use sha2::{Digest as _, Sha256 as ISha256};
use std::{
    fmt::{Debug, Display},
    ops::Deref,
};

const DIGEST_LENGTH: usize = 32;

/// Generate a SHA-256 digest of `message`.
pub fn hash(message: &[u8]) -> Digest {
    let array: [u8; DIGEST_LENGTH] = ISha256::digest(message).into();
    Digest(array)
}

/// Incremental SHA-256 hasher.
#[derive(Debug, Default)]
pub struct Sha256 {
    hasher: ISha256,
}

impl Sha256 {
    pub fn new() -> Self {
        Self {
            hasher: ISha256::new(),
        }
    }

    pub fn update(&mut self, message: &[u8]) -> &mut Self {
        self.hasher.update(message);
        self
    }

    /// Return the digest of everything written since the last finalize and reset the hasher.
    pub fn finalize(&mut self) -> Digest {
        let array: [u8; DIGEST_LENGTH] = self.hasher.finalize_reset().into();
        Digest(array)
    }
}

/// A SHA-256 digest.
///
/// The all-zero digest is never produced by hashing in practice and is used as a placeholder
/// for empty subtrees and absent predecessors.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Digest(pub [u8; DIGEST_LENGTH]);

impl Digest {
    pub const ZERO: Digest = Digest([0u8; DIGEST_LENGTH]);

    /// The largest digest (all bits set).
    pub const MAX: Digest = Digest([0xffu8; DIGEST_LENGTH]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; DIGEST_LENGTH]
    }

    /// Bit `index` counted from the most significant bit of the first byte.
    pub fn bit(&self, index: usize) -> bool {
        (self.0[index / 8] >> (7 - (index % 8))) & 1 == 1
    }

    /// Nibble `index` counted from the most significant nibble.
    pub fn nibble(&self, index: usize) -> u8 {
        let byte = self.0[index / 2];
        if index % 2 == 0 {
            byte >> 4
        } else {
            byte & 0x0f
        }
    }

    /// The next digest in big-endian order, or `None` for [Digest::MAX].
    pub fn successor(&self) -> Option<Digest> {
        let mut next = self.0;
        for byte in next.iter_mut().rev() {
            if *byte == 0xff {
                *byte = 0;
            } else {
                *byte += 1;
                return Some(Digest(next));
            }
        }
        None
    }

    /// The previous digest in big-endian order, or `None` for [Digest::ZERO].
    pub fn predecessor(&self) -> Option<Digest> {
        let mut prev = self.0;
        for byte in prev.iter_mut().rev() {
            if *byte == 0 {
                *byte = 0xff;
            } else {
                *byte -= 1;
                return Some(Digest(prev));
            }
        }
        None
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(value: [u8; DIGEST_LENGTH]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for Digest {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl Write for Digest {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for Digest {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        Ok(Self(<[u8; DIGEST_LENGTH]>::read_cfg(buf, &())?))
    }
}

impl FixedSize for Digest {
    const SIZE: usize = DIGEST_LENGTH;
}

impl Debug for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

impl Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocr_codec::{DecodeExt, Encode};
    use ocr_utils::hex;

    const HELLO_DIGEST: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_sha256() {
        let digest = hash(b"hello world");
        assert_eq!(hex(&digest), HELLO_DIGEST);

        let mut hasher = Sha256::new();
        hasher.update(b"hello ").update(b"world");
        assert_eq!(hasher.finalize(), digest);

        // Finalize resets the state.
        assert_eq!(hasher.finalize(), hash(b""));
    }

    #[test]
    fn test_codec() {
        let digest = hash(b"hello world");
        let encoded = digest.encode();
        assert_eq!(encoded.len(), DIGEST_LENGTH);
        assert_eq!(Digest::decode(encoded).unwrap(), digest);
    }

    #[test]
    fn test_bits_and_nibbles() {
        let mut raw = [0u8; 32];
        raw[0] = 0b1010_0101;
        let digest = Digest(raw);
        assert!(digest.bit(0));
        assert!(!digest.bit(1));
        assert!(digest.bit(7));
        assert_eq!(digest.nibble(0), 0b1010);
        assert_eq!(digest.nibble(1), 0b0101);
        assert_eq!(digest.nibble(2), 0);
    }

    #[test]
    fn test_successor_predecessor() {
        let mut raw = [0u8; 32];
        raw[31] = 0xff;
        let digest = Digest(raw);
        let next = digest.successor().unwrap();
        assert_eq!(next.0[30], 1);
        assert_eq!(next.0[31], 0);
        assert_eq!(next.predecessor().unwrap(), digest);
        assert!(Digest::MAX.successor().is_none());
        assert!(Digest::ZERO.predecessor().is_none());
    }
}
