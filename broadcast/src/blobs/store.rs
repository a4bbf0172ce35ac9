//! Persisted blob metadata and chunks.

use super::{BlobDigest, BlobMetadata};
use bytes::Bytes;
use ocr_codec::{Decode, Encode};
use ocr_storage::kv::{Error, Transaction};

const METADATA_PREFIX: &[u8] = b"blob/meta/";
const CHUNK_PREFIX: &[u8] = b"blob/chunk/";

fn metadata_key(blob: &BlobDigest) -> Vec<u8> {
    let mut key = METADATA_PREFIX.to_vec();
    key.extend_from_slice(blob);
    key
}

fn chunk_key(blob: &BlobDigest, index: u32) -> Vec<u8> {
    let mut key = CHUNK_PREFIX.to_vec();
    key.extend_from_slice(blob);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

pub fn put_metadata(
    txn: &mut Transaction,
    blob: &BlobDigest,
    metadata: &BlobMetadata,
) -> Result<(), Error> {
    txn.put(metadata_key(blob), metadata.encode().freeze())
}

/// Every blob whose metadata is stored.
pub fn all_metadata(txn: &Transaction) -> Result<Vec<(BlobDigest, BlobMetadata)>, Error> {
    let mut out = Vec::new();
    for (key, value) in txn.scan_prefix(METADATA_PREFIX, usize::MAX)? {
        let raw: [u8; 32] = key[METADATA_PREFIX.len()..]
            .try_into()
            .map_err(|_| Error::Corrupt("blob metadata key"))?;
        let metadata = BlobMetadata::decode_cfg(value, &usize::MAX)
            .map_err(|_| Error::Corrupt("blob metadata"))?;
        out.push((BlobDigest::from(raw), metadata));
    }
    Ok(out)
}

pub fn put_chunk(
    txn: &mut Transaction,
    blob: &BlobDigest,
    index: u32,
    chunk: Bytes,
) -> Result<(), Error> {
    txn.put(chunk_key(blob, index), chunk)
}

pub fn get_chunk(txn: &Transaction, blob: &BlobDigest, index: u32) -> Result<Option<Bytes>, Error> {
    txn.get(&chunk_key(blob, index))
}

/// Remove a blob's metadata and all of its chunks.
pub fn delete(txn: &mut Transaction, blob: &BlobDigest) -> Result<(), Error> {
    txn.delete(&metadata_key(blob))?;
    let mut prefix = CHUNK_PREFIX.to_vec();
    prefix.extend_from_slice(blob);
    txn.delete_prefix(&prefix)?;
    Ok(())
}
