//! Blob metadata and availability certificates.

use bytes::{Buf, BufMut, Bytes};
use ocr_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use ocr_cryptography::{hash, Digest, PrivateKey, PublicKey, Sha256, Signature};
use ocr_utils::{ConfigDigest, OracleId, SeqNr};
use std::collections::BTreeSet;

/// Identifies a blob within a committee configuration.
pub type BlobDigest = Digest;

const DIGEST_NAMESPACE: &[u8] = b"_OCR_BLOB_DIGEST";
const AVAILABLE_NAMESPACE: &[u8] = b"_OCR_BLOB_AVAILABLE";

/// Split `payload` into chunks of at most `chunk_size` bytes.
pub fn chunk(payload: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    (0..payload.len())
        .step_by(chunk_size)
        .map(|start| payload.slice(start..payload.len().min(start + chunk_size)))
        .collect()
}

/// Everything needed to fetch and verify a blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobMetadata {
    pub submitter: OracleId,
    pub payload_length: u64,
    pub chunk_digests: Vec<Digest>,

    /// The blob may be discarded once this sequence number is committed.
    pub expiry_seq_nr: SeqNr,
}

impl BlobMetadata {
    pub fn new(submitter: OracleId, chunks: &[Bytes], expiry_seq_nr: SeqNr) -> Self {
        Self {
            submitter,
            payload_length: chunks.iter().map(|c| c.len() as u64).sum(),
            chunk_digests: chunks.iter().map(|c| hash(c)).collect(),
            expiry_seq_nr,
        }
    }

    pub fn digest(&self, config_digest: &ConfigDigest) -> BlobDigest {
        let mut hasher = Sha256::new();
        hasher
            .update(DIGEST_NAMESPACE)
            .update(config_digest.as_bytes())
            .update(&self.submitter.to_be_bytes())
            .update(&self.payload_length.to_be_bytes())
            .update(&self.expiry_seq_nr.to_be_bytes());
        for digest in self.chunk_digests.iter() {
            hasher.update(digest);
        }
        hasher.finalize()
    }

    /// Whether the chunk layout is consistent with `chunk_size` and within `max_blob_size`.
    pub fn is_valid(&self, chunk_size: usize, max_blob_size: usize) -> bool {
        if self.payload_length > max_blob_size as u64 {
            return false;
        }
        let expected = (self.payload_length as usize).div_ceil(chunk_size);
        self.chunk_digests.len() == expected
    }

    /// Expected length of chunk `index`.
    pub fn chunk_length(&self, index: usize, chunk_size: usize) -> usize {
        let start = index * chunk_size;
        (self.payload_length as usize)
            .saturating_sub(start)
            .min(chunk_size)
    }
}

impl Write for BlobMetadata {
    fn write(&self, buf: &mut impl BufMut) {
        self.submitter.write(buf);
        self.payload_length.write(buf);
        self.chunk_digests.write(buf);
        self.expiry_seq_nr.write(buf);
    }
}

impl EncodeSize for BlobMetadata {
    fn encode_size(&self) -> usize {
        self.submitter.encode_size()
            + self.payload_length.encode_size()
            + self.chunk_digests.encode_size()
            + self.expiry_seq_nr.encode_size()
    }
}

impl Read for BlobMetadata {
    /// Maximum number of chunks.
    type Cfg = usize;

    fn read_cfg(buf: &mut impl Buf, max_chunks: &usize) -> Result<Self, CodecError> {
        let submitter = OracleId::read(buf)?;
        let payload_length = u64::read(buf)?;
        let chunk_digests = Vec::<Digest>::read_cfg(buf, &(RangeCfg::from(..=*max_chunks), ()))?;
        let expiry_seq_nr = SeqNr::read(buf)?;
        Ok(Self {
            submitter,
            payload_length,
            chunk_digests,
            expiry_seq_nr,
        })
    }
}

fn availability_payload(config_digest: &ConfigDigest, blob: &BlobDigest) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    payload.extend_from_slice(config_digest.as_bytes());
    payload.extend_from_slice(blob);
    payload
}

/// Attest that the signer holds every chunk of `blob`.
pub fn sign_availability(
    signer: &PrivateKey,
    config_digest: &ConfigDigest,
    blob: &BlobDigest,
) -> Signature {
    signer.sign(AVAILABLE_NAMESPACE, &availability_payload(config_digest, blob))
}

pub fn verify_availability(
    public_key: &PublicKey,
    config_digest: &ConfigDigest,
    blob: &BlobDigest,
    signature: &Signature,
) -> bool {
    public_key.verify(
        AVAILABLE_NAMESPACE,
        &availability_payload(config_digest, blob),
        signature,
    )
}

/// A blob's metadata together with byz-quorum-many availability signatures.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LightCertifiedBlob {
    pub metadata: BlobMetadata,

    /// Sorted by signer.
    pub signatures: Vec<(OracleId, Signature)>,
}

impl LightCertifiedBlob {
    pub fn digest(&self, config_digest: &ConfigDigest) -> BlobDigest {
        self.metadata.digest(config_digest)
    }

    /// Oracles that attested to holding the blob.
    pub fn signers(&self) -> impl Iterator<Item = OracleId> + '_ {
        self.signatures.iter().map(|(signer, _)| *signer)
    }

    /// Check that at least `quorum` distinct committee members signed availability.
    pub fn verify(
        &self,
        config_digest: &ConfigDigest,
        participants: &[PublicKey],
        quorum: usize,
    ) -> bool {
        let blob = self.digest(config_digest);
        let mut seen = BTreeSet::new();
        for (signer, signature) in self.signatures.iter() {
            let Some(public_key) = participants.get(*signer as usize) else {
                return false;
            };
            if !seen.insert(*signer) {
                return false;
            }
            if !verify_availability(public_key, config_digest, &blob, signature) {
                return false;
            }
        }
        seen.len() >= quorum
    }
}

impl Write for LightCertifiedBlob {
    fn write(&self, buf: &mut impl BufMut) {
        self.metadata.write(buf);
        self.signatures.write(buf);
    }
}

impl EncodeSize for LightCertifiedBlob {
    fn encode_size(&self) -> usize {
        self.metadata.encode_size() + self.signatures.encode_size()
    }
}

impl Read for LightCertifiedBlob {
    /// Maximum number of chunks and maximum number of signers.
    type Cfg = (usize, usize);

    fn read_cfg(buf: &mut impl Buf, (max_chunks, n): &(usize, usize)) -> Result<Self, CodecError> {
        let metadata = BlobMetadata::read_cfg(buf, max_chunks)?;
        let signatures =
            Vec::<(OracleId, Signature)>::read_cfg(buf, &(RangeCfg::from(..=*n), ((), ())))?;
        Ok(Self {
            metadata,
            signatures,
        })
    }
}
