//! Messages exchanged by blob engines.

use super::{BlobDigest, BlobMetadata};
use bytes::{Buf, BufMut, Bytes};
use ocr_codec::{EncodeSize, Error as CodecError, RangeCfg, Read, ReadExt, Write};
use ocr_cryptography::{Digest, Signature};
use ocr_p2p::Class;

/// Limits applied when decoding a [Message].
#[derive(Clone, Copy, Debug)]
pub struct Limits {
    pub max_chunks: usize,
    pub chunk_size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// A submitter announces a blob it holds.
    Offer(BlobMetadata),

    /// Ask for chunk `index` of `blob`.
    ChunkRequest { blob: BlobDigest, index: u32 },

    /// A chunk, or `None` if the responder does not hold it.
    ChunkResponse {
        blob: BlobDigest,
        index: u32,
        chunk: Option<Bytes>,
    },

    /// The sender holds every chunk of `blob`.
    Available {
        blob: BlobDigest,
        signature: Signature,
    },
}

impl Message {
    pub fn class(&self) -> Class {
        match self {
            Message::Offer(_) | Message::Available { .. } => Class::Plain,
            Message::ChunkRequest { .. } => Class::Request,
            Message::ChunkResponse { .. } => Class::Response,
        }
    }
}

const OFFER: u8 = 0;
const CHUNK_REQUEST: u8 = 1;
const CHUNK_RESPONSE: u8 = 2;
const AVAILABLE: u8 = 3;

impl Write for Message {
    fn write(&self, buf: &mut impl BufMut) {
        match self {
            Message::Offer(metadata) => {
                OFFER.write(buf);
                metadata.write(buf);
            }
            Message::ChunkRequest { blob, index } => {
                CHUNK_REQUEST.write(buf);
                blob.write(buf);
                index.write(buf);
            }
            Message::ChunkResponse { blob, index, chunk } => {
                CHUNK_RESPONSE.write(buf);
                blob.write(buf);
                index.write(buf);
                chunk.write(buf);
            }
            Message::Available { blob, signature } => {
                AVAILABLE.write(buf);
                blob.write(buf);
                signature.write(buf);
            }
        }
    }
}

impl EncodeSize for Message {
    fn encode_size(&self) -> usize {
        1 + match self {
            Message::Offer(metadata) => metadata.encode_size(),
            Message::ChunkRequest { blob, index } => blob.encode_size() + index.encode_size(),
            Message::ChunkResponse { blob, index, chunk } => {
                blob.encode_size() + index.encode_size() + chunk.encode_size()
            }
            Message::Available { blob, signature } => blob.encode_size() + signature.encode_size(),
        }
    }
}

impl Read for Message {
    type Cfg = Limits;

    fn read_cfg(buf: &mut impl Buf, limits: &Limits) -> Result<Self, CodecError> {
        match u8::read(buf)? {
            OFFER => Ok(Message::Offer(BlobMetadata::read_cfg(
                buf,
                &limits.max_chunks,
            )?)),
            CHUNK_REQUEST => {
                let blob = Digest::read(buf)?;
                let index = u32::read(buf)?;
                Ok(Message::ChunkRequest { blob, index })
            }
            CHUNK_RESPONSE => {
                let blob = Digest::read(buf)?;
                let index = u32::read(buf)?;
                let chunk = Option::<Bytes>::read_cfg(buf, &RangeCfg::from(..=limits.chunk_size))?;
                Ok(Message::ChunkResponse { blob, index, chunk })
            }
            AVAILABLE => {
                let blob = Digest::read(buf)?;
                let signature = Signature::read(buf)?;
                Ok(Message::Available { blob, signature })
            }
            tag => Err(CodecError::InvalidEnum("blobs::Message", tag)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocr_codec::{Decode, Encode};
    use ocr_cryptography::hash;

    const LIMITS: Limits = Limits {
        max_chunks: 4,
        chunk_size: 8,
    };

    #[test]
    fn test_oversized_chunk_rejected() {
        let message = Message::ChunkResponse {
            blob: hash(b"blob"),
            index: 0,
            chunk: Some(Bytes::from(vec![0u8; 9])),
        };
        assert!(Message::decode_cfg(message.encode(), &LIMITS).is_err());
    }

    #[test]
    fn test_too_many_chunks_rejected() {
        let metadata = BlobMetadata {
            submitter: 0,
            payload_length: 40,
            chunk_digests: vec![hash(b"c"); 5],
            expiry_seq_nr: 1,
        };
        let message = Message::Offer(metadata);
        assert!(Message::decode_cfg(message.encode(), &LIMITS).is_err());
    }

    #[test]
    fn test_go_away() {
        let message = Message::ChunkResponse {
            blob: hash(b"blob"),
            index: 3,
            chunk: None,
        };
        assert_eq!(message.class(), Class::Response);
        assert_eq!(Message::decode_cfg(message.encode(), &LIMITS).unwrap(), message);
    }
}
