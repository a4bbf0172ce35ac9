//! Serialize protocol messages and persisted records.
//!
//! # Overview
//!
//! Every value that crosses the network or is written to the database is encoded with the traits
//! in this crate. Decoding is designed to be safe on untrusted input:
//! - Variable-length collections require a [RangeCfg] (or a type-specific config) that bounds the
//!   number of items that may be allocated.
//! - [Decode] rejects trailing bytes so a message has exactly one valid encoding.
//!
//! # Example
//!
//! ```
//! use bytes::{Buf, BufMut};
//! use ocr_codec::{DecodeExt, Encode, EncodeSize, Error, Read, ReadExt, Write};
//!
//! #[derive(Debug, PartialEq)]
//! struct Bookmark {
//!     seq_nr: u64,
//!     committed: bool,
//! }
//!
//! impl Write for Bookmark {
//!     fn write(&self, buf: &mut impl BufMut) {
//!         self.seq_nr.write(buf);
//!         self.committed.write(buf);
//!     }
//! }
//!
//! impl Read for Bookmark {
//!     type Cfg = ();
//!
//!     fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
//!         let seq_nr = u64::read(buf)?;
//!         let committed = bool::read(buf)?;
//!         Ok(Self { seq_nr, committed })
//!     }
//! }
//!
//! impl EncodeSize for Bookmark {
//!     fn encode_size(&self) -> usize {
//!         self.seq_nr.encode_size() + self.committed.encode_size()
//!     }
//! }
//!
//! let bookmark = Bookmark { seq_nr: 7, committed: true };
//! let encoded = bookmark.encode();
//! assert_eq!(Bookmark::decode(encoded).unwrap(), bookmark);
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod types;
pub mod varint;

pub use codec::{Codec, Decode, DecodeExt, Encode, EncodeSize, FixedSize, Read, ReadExt, Write};
pub use config::RangeCfg;
pub use error::Error;

/// Ensure that `buf` holds at least `len` more bytes.
#[inline]
pub(crate) fn at_least(buf: &impl bytes::Buf, len: usize) -> Result<(), Error> {
    if buf.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    Ok(())
}
