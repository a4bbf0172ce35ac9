//! Ed25519 keys and signatures.
//!
//! # Example
//! ```rust
//! use ocr_cryptography::PrivateKey;
//!
//! let signer = PrivateKey::from_seed(0);
//! let signature = signer.sign(b"_PREPARE", b"block");
//! assert!(signer.public_key().verify(b"_PREPARE", b"block", &signature));
//! assert!(!signer.public_key().verify(b"_COMMIT", b"block", &signature));
//! ```

use crate::Error;
use bytes::{Buf, BufMut};
use ocr_codec::{Error as CodecError, FixedSize, Read, ReadExt, Write};
use ocr_utils::{hex, union_unique};
use rand::{CryptoRng, RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::{
    fmt::{Debug, Display},
    hash::{Hash, Hasher},
};

const PRIVATE_KEY_LENGTH: usize = 32;
const PUBLIC_KEY_LENGTH: usize = 32;
const SIGNATURE_LENGTH: usize = 64;

/// Ed25519 signing key.
#[derive(Clone)]
pub struct PrivateKey {
    key: ed25519_consensus::SigningKey,
}

impl PrivateKey {
    /// Generate a new key from `rng`.
    pub fn from_rng<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        Self {
            key: ed25519_consensus::SigningKey::new(rng),
        }
    }

    /// Deterministically derive a key from `seed`.
    ///
    /// Only suitable for tests and simulations.
    pub fn from_seed(seed: u64) -> Self {
        let mut rng = ChaCha20Rng::seed_from_u64(seed);
        Self::from_rng(&mut rng)
    }

    /// Load a key from its 32-byte encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let raw: [u8; PRIVATE_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| Error::InvalidPrivateKeyLength)?;
        Ok(Self {
            key: ed25519_consensus::SigningKey::from(raw),
        })
    }

    pub fn to_bytes(&self) -> [u8; PRIVATE_KEY_LENGTH] {
        self.key.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(self.key.verification_key())
    }

    /// Sign `message` under `namespace`.
    pub fn sign(&self, namespace: &[u8], message: &[u8]) -> Signature {
        let payload = union_unique(namespace, message);
        Signature::from(self.key.sign(&payload))
    }
}

impl Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey({})", self.public_key())
    }
}

/// Ed25519 verification key.
#[derive(Clone, Copy)]
pub struct PublicKey {
    raw: [u8; PUBLIC_KEY_LENGTH],
    key: ed25519_consensus::VerificationKey,
}

impl PublicKey {
    /// Verify `signature` over `message` under `namespace`.
    pub fn verify(&self, namespace: &[u8], message: &[u8], signature: &Signature) -> bool {
        let payload = union_unique(namespace, message);
        self.key.verify(&signature.signature, &payload).is_ok()
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LENGTH] {
        &self.raw
    }
}

impl From<ed25519_consensus::VerificationKey> for PublicKey {
    fn from(key: ed25519_consensus::VerificationKey) -> Self {
        Self {
            raw: key.to_bytes(),
            key,
        }
    }
}

impl TryFrom<[u8; PUBLIC_KEY_LENGTH]> for PublicKey {
    type Error = Error;

    fn try_from(raw: [u8; PUBLIC_KEY_LENGTH]) -> Result<Self, Self::Error> {
        let key = ed25519_consensus::VerificationKey::try_from(raw)
            .map_err(|_| Error::InvalidPublicKey)?;
        Ok(Self { raw, key })
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for PublicKey {}

impl Hash for PublicKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl Write for PublicKey {
    fn write(&self, buf: &mut impl BufMut) {
        self.raw.write(buf);
    }
}

impl Read for PublicKey {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let raw = <[u8; PUBLIC_KEY_LENGTH]>::read(buf)?;
        Self::try_from(raw).map_err(|_| CodecError::Invalid("PublicKey", "invalid point"))
    }
}

impl FixedSize for PublicKey {
    const SIZE: usize = PUBLIC_KEY_LENGTH;
}

impl Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.raw))
    }
}

impl Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.raw[..8]))
    }
}

/// Ed25519 signature.
#[derive(Clone, Copy)]
pub struct Signature {
    raw: [u8; SIGNATURE_LENGTH],
    signature: ed25519_consensus::Signature,
}

impl Signature {
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_LENGTH] {
        &self.raw
    }
}

impl From<ed25519_consensus::Signature> for Signature {
    fn from(signature: ed25519_consensus::Signature) -> Self {
        Self {
            raw: signature.to_bytes(),
            signature,
        }
    }
}

impl From<[u8; SIGNATURE_LENGTH]> for Signature {
    fn from(raw: [u8; SIGNATURE_LENGTH]) -> Self {
        Self {
            raw,
            signature: ed25519_consensus::Signature::from(raw),
        }
    }
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Signature {}

impl Hash for Signature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl Write for Signature {
    fn write(&self, buf: &mut impl BufMut) {
        self.raw.write(buf);
    }
}

impl Read for Signature {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, CodecError> {
        let raw = <[u8; SIGNATURE_LENGTH]>::read(buf)?;
        Ok(Self::from(raw))
    }
}

impl FixedSize for Signature {
    const SIZE: usize = SIGNATURE_LENGTH;
}

impl Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.raw))
    }
}

impl Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex(&self.raw[..8]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocr_codec::{DecodeExt, Encode};

    const NAMESPACE: &[u8] = b"_TEST";

    #[test]
    fn test_sign_verify() {
        let signer = PrivateKey::from_seed(7);
        let public_key = signer.public_key();
        let signature = signer.sign(NAMESPACE, b"message");
        assert!(public_key.verify(NAMESPACE, b"message", &signature));
        assert!(!public_key.verify(NAMESPACE, b"other", &signature));
        assert!(!public_key.verify(b"_OTHER", b"message", &signature));
        assert!(!PrivateKey::from_seed(8)
            .public_key()
            .verify(NAMESPACE, b"message", &signature));
    }

    #[test]
    fn test_deterministic_seed() {
        assert_eq!(
            PrivateKey::from_seed(1).public_key(),
            PrivateKey::from_seed(1).public_key()
        );
        assert_ne!(
            PrivateKey::from_seed(1).public_key(),
            PrivateKey::from_seed(2).public_key()
        );
    }

    #[test]
    fn test_private_key_bytes() {
        let signer = PrivateKey::from_seed(3);
        let restored = PrivateKey::from_bytes(&signer.to_bytes()).unwrap();
        assert_eq!(signer.public_key(), restored.public_key());
        assert_eq!(
            PrivateKey::from_bytes(&[0u8; 5]).unwrap_err(),
            Error::InvalidPrivateKeyLength
        );
    }

    #[test]
    fn test_codec() {
        let signer = PrivateKey::from_seed(4);
        let public_key = signer.public_key();
        let decoded = PublicKey::decode(public_key.encode()).unwrap();
        assert_eq!(decoded, public_key);

        let signature = signer.sign(NAMESPACE, b"message");
        let decoded = Signature::decode(signature.encode()).unwrap();
        assert!(public_key.verify(NAMESPACE, b"message", &decoded));
    }

    #[test]
    fn test_tampered_signature() {
        let signer = PrivateKey::from_seed(5);
        let signature = signer.sign(NAMESPACE, b"message");
        let mut raw = *signature.as_bytes();
        raw[0] ^= 1;
        let tampered = Signature::from(raw);
        assert!(!signer.public_key().verify(NAMESPACE, b"message", &tampered));
    }
}
