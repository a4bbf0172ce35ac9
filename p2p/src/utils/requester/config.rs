//! Configuration for `Requester`.

use governor::Quota;
use prometheus_client::registry::Registry;
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Configuration for the requester.
pub struct Config<P> {
    /// Local identity of the participant (if any).
    pub me: Option<P>,

    /// Rate limit for requests per participant.
    pub rate_limit: Quota,

    /// Initial expected performance for new participants.
    pub initial: Duration,

    /// Timeout for requests.
    pub timeout: Duration,

    /// Seed for shuffling participants.
    pub seed: u64,

    /// Registry for requester metrics.
    pub registry: Arc<Mutex<Registry>>,

    /// Prefix distinguishing this requester's metrics from others in the same registry.
    pub metrics_prefix: &'static str,
}
