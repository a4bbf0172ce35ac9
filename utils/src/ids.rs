//! Identifiers shared by every component of the protocol.

use bytes::{Buf, BufMut};
use ocr_codec::{Error, FixedSize, Read, Write};
use std::fmt::{Debug, Display};

/// Index of an oracle within the committee, in `[0, n)`.
pub type OracleId = u32;

/// Period during which a single oracle leads.
pub type Epoch = u64;

/// Position of a committed state transition in the global order.
pub type SeqNr = u64;

/// Position of a round within an epoch.
pub type Round = u64;

/// Identifies one committee configuration (membership, keys, and thresholds).
///
/// Every signature domain and every digest includes it, so messages from one configuration are
/// never accepted under another.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigDigest(pub [u8; 32]);

impl ConfigDigest {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<[u8; 32]> for ConfigDigest {
    fn from(value: [u8; 32]) -> Self {
        Self(value)
    }
}

impl AsRef<[u8]> for ConfigDigest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Write for ConfigDigest {
    fn write(&self, buf: &mut impl BufMut) {
        self.0.write(buf);
    }
}

impl Read for ConfigDigest {
    type Cfg = ();

    fn read_cfg(buf: &mut impl Buf, _: &()) -> Result<Self, Error> {
        Ok(Self(<[u8; 32]>::read_cfg(buf, &())?))
    }
}

impl FixedSize for ConfigDigest {
    const SIZE: usize = 32;
}

impl Debug for ConfigDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", crate::hex(&self.0))
    }
}

impl Display for ConfigDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", crate::hex(&self.0[..8]))
    }
}
