//! Codec implementations for tuples.

use crate::{EncodeSize, Error, Read, Write};
use bytes::{Buf, BufMut};

macro_rules! impl_tuple {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: Write),+> Write for ($($name,)+) {
            #[inline]
            fn write(&self, buf: &mut impl BufMut) {
                $(self.$idx.write(buf);)+
            }
        }

        impl<$($name: EncodeSize),+> EncodeSize for ($($name,)+) {
            #[inline]
            fn encode_size(&self) -> usize {
                0 $(+ self.$idx.encode_size())+
            }
        }

        impl<$($name: Read),+> Read for ($($name,)+) {
            type Cfg = ($($name::Cfg,)+);

            #[inline]
            fn read_cfg(buf: &mut impl Buf, cfg: &Self::Cfg) -> Result<Self, Error> {
                Ok(($($name::read_cfg(buf, &cfg.$idx)?,)+))
            }
        }
    };
}

impl_tuple!(A 0, B 1);
impl_tuple!(A 0, B 1, C 2);
impl_tuple!(A 0, B 1, C 2, D 3);
