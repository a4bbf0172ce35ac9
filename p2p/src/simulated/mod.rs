//! Simulate a committee network within a single process.
//!
//! Each oracle registers one [Sender]/[Receiver] pair per channel. Links between oracles are
//! unidirectional and configurable (latency and success rate) at runtime through the [Oracle]
//! handle, which makes it possible to partition the committee, drop traffic, or heal links while
//! a test is running.
//!
//! Messages an oracle sends to itself are delivered immediately and never dropped.
//!
//! # Example
//!
//! ```rust
//! use ocr_p2p::{simulated::{Config, Link, Network}, Receiver, Recipients, Sender};
//! use bytes::Bytes;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (network, mut oracle) = Network::new(Config::default());
//! tokio::spawn(network.run());
//!
//! let (mut sender, _) = oracle.register(0, 0, 1024).await.unwrap();
//! let (_, mut receiver) = oracle.register(1, 0, 1024).await.unwrap();
//! oracle.add_link(0, 1, Link::instant()).await.unwrap();
//!
//! sender.send(Recipients::One(1), Bytes::from_static(b"hi"), true).await.unwrap();
//! let (origin, message) = receiver.recv().await.unwrap();
//! assert_eq!(origin, 0);
//! assert_eq!(message, Bytes::from_static(b"hi"));
//! # }
//! ```

mod metrics;
mod network;

pub use network::{Config, Control, Link, Network, Oracle, Receiver, Sender};

use crate::Channel;
use thiserror::Error;

/// Errors that can occur when interacting with the simulated network.
#[derive(Debug, Error)]
pub enum Error {
    #[error("message too large: {0}")]
    MessageTooLarge(usize),
    #[error("network closed")]
    NetworkClosed,
    #[error("not valid to link self")]
    LinkingSelf,
    #[error("channel already registered: {0}")]
    ChannelAlreadyRegistered(Channel),
    #[error("invalid success rate (must be in [0, 1]): {0}")]
    InvalidSuccessRate(f64),
}
