//! LEB128 variable-length integers.
//!
//! Each byte carries 7 bits of the value and a continuation bit. Lengths are
//! always encoded this way so that short collections cost a single byte.

use crate::Error;
use bytes::{Buf, BufMut};

const DATA_BITS_PER_BYTE: u32 = 7;
const DATA_BITS_MASK: u8 = 0x7F;
const CONTINUATION_BIT_MASK: u8 = 0x80;
const MAX_BYTES: usize = 10;

/// Write `value` as a varint.
pub fn write(value: u64, buf: &mut impl BufMut) {
    let mut val = value;
    while val >= u64::from(CONTINUATION_BIT_MASK) {
        buf.put_u8((val as u8 & DATA_BITS_MASK) | CONTINUATION_BIT_MASK);
        val >>= DATA_BITS_PER_BYTE;
    }
    buf.put_u8(val as u8);
}

/// Read a varint, rejecting overlong and overflowing encodings.
pub fn read(buf: &mut impl Buf) -> Result<u64, Error> {
    let mut result: u64 = 0;
    for i in 0..MAX_BYTES {
        if !buf.has_remaining() {
            return Err(Error::EndOfBuffer);
        }
        let byte = buf.get_u8();
        let shift = DATA_BITS_PER_BYTE * i as u32;

        // The tenth byte may only carry the single remaining bit.
        if i == MAX_BYTES - 1 && byte > 1 {
            return Err(Error::InvalidVarint);
        }
        result |= u64::from(byte & DATA_BITS_MASK) << shift;
        if byte & CONTINUATION_BIT_MASK == 0 {
            // A trailing zero byte is a non-canonical encoding.
            if byte == 0 && i > 0 {
                return Err(Error::InvalidVarint);
            }
            return Ok(result);
        }
    }
    Err(Error::InvalidVarint)
}

/// Number of bytes [write] produces for `value`.
pub fn size(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.max(1).div_ceil(DATA_BITS_PER_BYTE as usize)
}

/// Write a collection length.
pub fn write_len(len: usize, buf: &mut impl BufMut) {
    let len = u32::try_from(len).expect("length exceeds u32");
    write(u64::from(len), buf);
}

/// Size of an encoded collection length.
pub fn len_size(len: usize) -> usize {
    let len = u32::try_from(len).expect("length exceeds u32");
    size(u64::from(len))
}

/// Read a collection length and check it against `range`.
pub fn read_len(buf: &mut impl Buf, range: &crate::RangeCfg) -> Result<usize, Error> {
    let len = read(buf)?;
    let len = u32::try_from(len).map_err(|_| Error::InvalidUsize)?;
    let len = usize::try_from(len).map_err(|_| Error::InvalidUsize)?;
    if !range.contains(&len) {
        return Err(Error::InvalidLength(len));
    }
    Ok(len)
}
