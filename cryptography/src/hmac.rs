//! Keyed pseudo-random function over SHA-256.

use crate::Digest;
use hmac::{Hmac, Mac};
use sha2::Sha256;

/// Compute `HMAC-SHA-256(key, message)`.
pub fn hmac_sha256(key: &[u8], message: &[u8]) -> Digest {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(message);
    let array: [u8; 32] = mac.finalize().into_bytes().into();
    Digest(array)
}
