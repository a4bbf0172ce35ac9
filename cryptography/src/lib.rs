//! Generate keys, sign protocol messages, and digest content.
//!
//! All signatures are Ed25519 over a namespaced payload (see [ocr_utils::union_unique]) and all
//! content digests are SHA-256.

pub mod ed25519;
pub use ed25519::{PrivateKey, PublicKey, Signature};
pub mod hmac;
pub mod sha256;
pub use sha256::{hash, Digest, Sha256};

use thiserror::Error;

/// Errors produced when parsing key material.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("invalid private key length")]
    InvalidPrivateKeyLength,
    #[error("invalid signature")]
    InvalidSignature,
}
