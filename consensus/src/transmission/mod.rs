//! Hand attested reports to the [ContractTransmitter](crate::ContractTransmitter).
//!
//! Transmitting is costly, so not every oracle transmits every report. For each report, the
//! committee derives a secret pseudo-random order of its members from
//! `transmission_order_key` (see [permutation]). The first `transmission_schedule[0]` oracles in
//! the order transmit immediately, the next `transmission_schedule[1]` after `delta_stage`, and so
//! on. Oracles beyond the schedule never transmit the report.
//!
//! Before scheduling and again right before transmitting, the plugin may decline (for example,
//! because the report has already landed).

mod actor;
mod ingress;
mod metrics;
mod schedule;

pub use actor::Actor;
pub use ingress::{Mailbox, Message};
pub use schedule::{delay, permutation, stage};

use crate::{ContractTransmitter, Plugin, SharedConfig};
use ocr_utils::OracleId;
use prometheus_client::registry::Registry;
use std::sync::{Arc, Mutex};

/// Configuration for report transmission.
pub struct Config<P: Plugin, T: ContractTransmitter> {
    pub me: OracleId,
    pub shared: SharedConfig,
    pub plugin: P,
    pub transmitter: T,

    /// Sequence numbers, counting back from the highest seen, for which repeated reports are
    /// recognized.
    pub window: u64,

    /// The maximum size of the mailbox backlog.
    pub mailbox_size: usize,

    pub registry: Arc<Mutex<Registry>>,
}
