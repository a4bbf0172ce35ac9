//! Disseminate large payloads to the committee and certify their availability.
//!
//! Consensus messages are small. Payloads that are too large to embed in an observation or
//! outcome are instead disseminated ahead of time with [BlobBroadcaster::broadcast_blob], which
//! returns a [LightCertifiedBlob]: the blob's metadata plus enough availability signatures that
//! at least one honest oracle is guaranteed to hold every chunk. Any oracle can then reconstruct
//! the payload with [BlobFetcher::fetch_blob].
//!
//! The [blobs] module provides the engine that implements both traits.

use bytes::Bytes;
use ocr_storage::kv;
use ocr_utils::SeqNr;
use std::future::Future;
use thiserror::Error;

pub mod blobs;
pub use blobs::{BlobDigest, BlobMetadata, LightCertifiedBlob};

/// Errors that can occur when broadcasting or fetching a blob.
#[derive(Error, Debug)]
pub enum Error {
    #[error("blob too large: {0}")]
    TooLarge(usize),
    #[error("blob expired")]
    Expired,
    #[error("invalid certificate")]
    InvalidCertificate,
    #[error("engine closed")]
    Closed,
    #[error("storage: {0}")]
    Storage(#[from] kv::Error),
    #[error("codec: {0}")]
    Codec(#[from] ocr_codec::Error),
}

/// Disseminate a payload and obtain a certificate of its availability.
pub trait BlobBroadcaster: Clone + Send + Sync + 'static {
    /// Resolves once byz-quorum-many oracles attest to holding the payload, or fails if the
    /// blob expires (`expiry_seq_nr` is committed) first.
    fn broadcast_blob(
        &self,
        payload: Bytes,
        expiry_seq_nr: SeqNr,
    ) -> impl Future<Output = Result<LightCertifiedBlob, Error>> + Send;
}

/// Reconstruct the payload behind a certificate.
pub trait BlobFetcher: Clone + Send + Sync + 'static {
    /// Resolves with the payload once every chunk is held locally.
    fn fetch_blob(
        &self,
        certificate: LightCertifiedBlob,
    ) -> impl Future<Output = Result<Bytes, Error>> + Send;
}
