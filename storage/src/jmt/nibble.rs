//! Paths through the tree expressed as sequences of nibbles.

use bytes::{Buf, BufMut};
use ocr_codec::{EncodeSize, Error as CodecError, Read, ReadExt, Write};
use ocr_cryptography::Digest;

/// Maximum depth of the tree (a 256-bit key digest has 64 nibbles).
pub const MAX_NIBBLES: usize = 64;

/// The position of a node: the nibbles of the key digest consumed to reach it from the root.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NibblePath(Vec<u8>);

impl NibblePath {
    /// The root path.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// The first `len` nibbles of `digest`.
    pub fn from_digest(digest: &Digest, len: usize) -> Self {
        Self((0..len).map(|i| digest.nibble(i)).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn nibbles(&self) -> &[u8] {
        &self.0
    }

    /// The path of this node's child at `nibble`.
    pub fn child(&self, nibble: u8) -> Self {
        debug_assert!(nibble < 16);
        let mut nibbles = Vec::with_capacity(self.0.len() + 1);
        nibbles.extend_from_slice(&self.0);
        nibbles.push(nibble);
        Self(nibbles)
    }

    /// Smallest digest under this path.
    pub fn min_digest(&self) -> Digest {
        self.pad(0x0)
    }

    /// Largest digest under this path.
    pub fn max_digest(&self) -> Digest {
        self.pad(0xf)
    }

    fn pad(&self, fill: u8) -> Digest {
        let mut bytes = [(fill << 4) | fill; 32];
        for (i, nibble) in self.0.iter().enumerate() {
            let byte = &mut bytes[i / 2];
            if i % 2 == 0 {
                *byte = (nibble << 4) | (*byte & 0x0f);
            } else {
                *byte = (*byte & 0xf0) | nibble;
            }
        }
        Digest(bytes)
    }
}

impl std::fmt::Debug for NibblePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for nibble in self.0.iter() {
            write!(f, "{:x}", nibble)?;
        }
        Ok(())
    }
}

impl Write for NibblePath {
    fn write(&self, buf: &mut impl BufMut) {
        (self.0.len() as u8).write(buf);
        for pair in self.0.chunks(2) {
            let low = pair.get(1).copied().unwrap_or(0);
            buf.put_u8((pair[0] << 4) | low);
        }
    }
}

impl EncodeSize for NibblePath {
    fn encode_size(&self) -> usize {
        1 + self.0.len().div_ceil(2)
    }
}

impl Read for NibblePath {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let len = u8::read(buf)? as usize;
        if len > MAX_NIBBLES {
            return Err(CodecError::InvalidLength(len));
        }
        let mut nibbles = Vec::with_capacity(len);
        for i in 0..len.div_ceil(2) {
            let byte = u8::read(buf)?;
            nibbles.push(byte >> 4);
            if 2 * i + 1 < len {
                nibbles.push(byte & 0x0f);
            } else if byte & 0x0f != 0 {
                return Err(CodecError::Invalid("NibblePath", "non-zero padding"));
            }
        }
        Ok(Self(nibbles))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocr_codec::{DecodeExt, Encode};
    use ocr_cryptography::hash;

    #[test]
    fn test_from_digest() {
        let digest = Digest([0xab; 32]);
        let path = NibblePath::from_digest(&digest, 3);
        assert_eq!(path.nibbles(), &[0xa, 0xb, 0xa]);
        assert_eq!(format!("{:?}", path), "aba");
    }

    #[test]
    fn test_bounds() {
        let path = NibblePath::new().child(0x3).child(0xc).child(0x5);
        let min = path.min_digest();
        let max = path.max_digest();
        assert_eq!(min.0[0], 0x3c);
        assert_eq!(min.0[1], 0x50);
        assert_eq!(max.0[1], 0x5f);
        assert_eq!(max.0[31], 0xff);
        assert!(min < max);

        let root = NibblePath::new();
        assert_eq!(root.min_digest(), Digest::ZERO);
        assert_eq!(root.max_digest(), Digest::MAX);
    }

    #[test]
    fn test_codec() {
        let digest = hash(b"key");
        for len in [0, 1, 2, 7, MAX_NIBBLES] {
            let path = NibblePath::from_digest(&digest, len);
            let encoded = path.encode();
            assert_eq!(encoded.len(), path.encode_size());
            assert_eq!(NibblePath::decode(encoded).unwrap(), path);
        }
    }

    #[test]
    fn test_rejects_padding() {
        let encoded = bytes::Bytes::from_static(&[1, 0x1f]);
        assert!(NibblePath::decode(encoded).is_err());
    }
}
