//! Error types for codec operations.

use thiserror::Error;

/// Error returned when decoding fails.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unexpected end of buffer")]
    EndOfBuffer,
    #[error("extra data found: {0} bytes")]
    ExtraData(usize),
    #[error("invalid length: {0}")]
    InvalidLength(usize),
    #[error("invalid varint")]
    InvalidVarint,
    #[error("invalid usize")]
    InvalidUsize,
    #[error("invalid bool")]
    InvalidBool,
    #[error("invalid enum tag {1} in {0}")]
    InvalidEnum(&'static str, u8),
    #[error("invalid {0}: {1}")]
    Invalid(&'static str, &'static str),
}
