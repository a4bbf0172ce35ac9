//! Communicate with committee members over typed channels.
//!
//! Every component of an oracle owns one channel. Messages are opaque [Bytes]; encoding,
//! size limits, and authentication of the content are the responsibility of the component.
//! The transport only guarantees that the [OracleId] attached to a received message is the
//! oracle that sent it.
//!
//! # Status
//!
//! `ocr-p2p` ships an in-process [simulated] network used by tests and the demo binary.
//! Production deployments supply their own [Sender]/[Receiver] implementations.

use bytes::Bytes;
use ocr_utils::OracleId;
use std::{error::Error as StdError, fmt::Debug, future::Future};

pub mod simulated;
pub mod utils;

/// Identifier of a component channel.
pub type Channel = u32;

/// Tuple representing a message received from a given oracle.
pub type Message = (OracleId, Bytes);

/// Enum indicating the set of recipients to send a message to.
///
/// [Recipients::All] includes the sender itself, so a leader processes its own proposals
/// through the same path as every follower.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipients {
    All,
    Some(Vec<OracleId>),
    One(OracleId),
}

/// Transport class of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Class {
    /// Protocol traffic that drives agreement.
    Plain,
    /// A request expecting a [Class::Response].
    Request,
    /// A reply to a [Class::Request].
    Response,
}

impl Class {
    /// Whether the transport should send the message ahead of queued low-priority traffic.
    pub fn priority(&self) -> bool {
        matches!(self, Class::Plain)
    }
}

/// Interface for sending messages to a set of recipients.
pub trait Sender: Clone + Debug + Send + Sync + 'static {
    /// Error that can occur when sending a message.
    type Error: Debug + StdError + Send + Sync;

    /// Send a message to a set of recipients.
    ///
    /// Returns the oracles the message was handed to (delivery is not guaranteed).
    fn send(
        &mut self,
        recipients: Recipients,
        message: Bytes,
        priority: bool,
    ) -> impl Future<Output = Result<Vec<OracleId>, Self::Error>> + Send;
}

/// Interface for receiving messages from arbitrary oracles.
pub trait Receiver: Debug + Send + 'static {
    /// Error that can occur when receiving a message.
    type Error: Debug + StdError + Send + Sync;

    /// Receive a message from an arbitrary oracle.
    fn recv(&mut self) -> impl Future<Output = Result<Message, Self::Error>> + Send;
}

/// Interface for excluding a misbehaving oracle from all future communication.
pub trait Blocker: Clone + Send + Sync + 'static {
    /// Drop all future messages from `peer`.
    fn block(&mut self, peer: OracleId) -> impl Future<Output = ()> + Send;
}
