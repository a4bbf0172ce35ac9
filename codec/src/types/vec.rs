//! Codec implementation for [Vec].

use crate::{varint, EncodeSize, Error, RangeCfg, Read, Write};
use bytes::{Buf, BufMut};

impl<T: Write> Write for Vec<T> {
    #[inline]
    fn write(&self, buf: &mut impl BufMut) {
        varint::write_len(self.len(), buf);
        for item in self {
            item.write(buf);
        }
    }
}

impl<T: EncodeSize> EncodeSize for Vec<T> {
    #[inline]
    fn encode_size(&self) -> usize {
        varint::len_size(self.len()) + self.iter().map(EncodeSize::encode_size).sum::<usize>()
    }
}

impl<T: Read> Read for Vec<T> {
    type Cfg = (RangeCfg, T::Cfg);

    #[inline]
    fn read_cfg(buf: &mut impl Buf, (range, cfg): &Self::Cfg) -> Result<Self, Error> {
        let len = varint::read_len(buf, range)?;

        // Each item occupies at least one byte, so never reserve more than remains.
        let mut vec = Vec::with_capacity(len.min(buf.remaining()));
        for _ in 0..len {
            vec.push(T::read_cfg(buf, cfg)?);
        }
        Ok(vec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Decode, Encode};

    #[test]
    fn test_vec() {
        let values = [vec![], vec![1u8], vec![1u8, 2u8, 3u8]];
        for value in values {
            let encoded = value.encode();
            assert_eq!(encoded.len(), value.len() + 1);

            let len = value.len();
            let decoded = Vec::<u8>::decode_cfg(encoded, &(RangeCfg::exact(len), ())).unwrap();
            assert_eq!(value, decoded);

            assert!(matches!(
                Vec::<u8>::decode_cfg(value.encode(), &(RangeCfg::from(len + 1..), ())),
                Err(Error::InvalidLength(_))
            ));
        }
    }
}
