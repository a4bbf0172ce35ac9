//! Core codec traits.

use crate::error::Error;
use bytes::{Buf, BufMut, BytesMut};

/// Types that can be written to a buffer.
pub trait Write {
    /// Write this value to `buf`.
    ///
    /// Implementations may panic if `buf` lacks capacity.
    fn write(&self, buf: &mut impl BufMut);
}

/// Types that know the exact number of bytes [Write::write] produces.
pub trait EncodeSize {
    /// Number of bytes produced by [Write::write].
    fn encode_size(&self) -> usize;
}

/// Types with a constant encoded size.
pub trait FixedSize {
    /// The encoded size in bytes.
    const SIZE: usize;
}

impl<T: FixedSize> EncodeSize for T {
    #[inline]
    fn encode_size(&self) -> usize {
        T::SIZE
    }
}

/// Types that can be read from a buffer.
///
/// `Cfg` carries the limits used when decoding untrusted input (for example, the largest
/// number of items a vector may hold). Types without limits use `()`.
pub trait Read: Sized {
    /// Configuration used while reading.
    type Cfg: Clone + Send + Sync + 'static;

    /// Read a value from `buf`, consuming exactly the bytes that were written for it.
    fn read_cfg(buf: &mut impl Buf, cfg: &Self::Cfg) -> Result<Self, Error>;
}

/// Types that can be encoded into a fresh buffer.
pub trait Encode: Write + EncodeSize {
    /// Encode this value into a new [BytesMut].
    ///
    /// Panics if [Write::write] does not write [EncodeSize::encode_size] bytes.
    fn encode(&self) -> BytesMut {
        let len = self.encode_size();
        let mut buffer = BytesMut::with_capacity(len);
        self.write(&mut buffer);
        assert_eq!(buffer.len(), len, "write() did not write expected bytes");
        buffer
    }
}

impl<T: Write + EncodeSize> Encode for T {}

/// Types that can be decoded from a buffer that must be fully consumed.
pub trait Decode: Read {
    /// Decode a value from `buf`, failing if any bytes remain.
    fn decode_cfg(mut buf: impl Buf, cfg: &Self::Cfg) -> Result<Self, Error> {
        let result = Self::read_cfg(&mut buf, cfg)?;
        let remaining = buf.remaining();
        if remaining > 0 {
            return Err(Error::ExtraData(remaining));
        }
        Ok(result)
    }
}

impl<T: Read> Decode for T {}

/// Types that can be both encoded and decoded.
pub trait Codec: Encode + Decode {}

impl<T: Encode + Decode> Codec for T {}

/// Read helper for types that need no configuration.
pub trait ReadExt: Read<Cfg = ()> {
    /// Read a value using the unit config.
    fn read(buf: &mut impl Buf) -> Result<Self, Error> {
        Self::read_cfg(buf, &())
    }
}

impl<T: Read<Cfg = ()>> ReadExt for T {}

/// Decode helper for types that need no configuration.
pub trait DecodeExt: Decode<Cfg = ()> {
    /// Decode a value using the unit config.
    fn decode(buf: impl Buf) -> Result<Self, Error> {
        Self::decode_cfg(buf, &())
    }
}

impl<T: Decode<Cfg = ()>> DecodeExt for T {}
