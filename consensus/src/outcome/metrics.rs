use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Status {
    /// Handled in the current epoch.
    Processed,
    /// Held until its epoch starts.
    Buffered,
    /// For a past epoch, or displaced from a full buffer.
    Dropped,
    /// Malformed or failed verification.
    Invalid,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: Status,
}

impl StatusLabel {
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

/// Metrics for the [`Actor`](super::Actor)
pub struct Metrics {
    /// Epoch outcome generation runs in
    pub epoch: Gauge,
    /// Highest sequence number applied
    pub committed: Gauge,
    /// Inbound messages by outcome
    pub inbound: Family<StatusLabel, Counter>,
    /// Rounds started as leader
    pub rounds: Counter,
    /// Re-proposals whose replay disagreed with their certificate
    pub replay_mismatches: Counter,
}

impl Metrics {
    pub fn init(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            epoch: Gauge::default(),
            committed: Gauge::default(),
            inbound: Family::default(),
            rounds: Counter::default(),
            replay_mismatches: Counter::default(),
        };
        let mut registry = registry.lock().unwrap();
        let registry = registry.sub_registry_with_prefix("outcome");
        registry.register("epoch", "Current epoch", metrics.epoch.clone());
        registry.register(
            "committed",
            "Highest sequence number applied",
            metrics.committed.clone(),
        );
        registry.register(
            "inbound",
            "Inbound messages by outcome",
            metrics.inbound.clone(),
        );
        registry.register("rounds", "Rounds started as leader", metrics.rounds.clone());
        registry.register(
            "replay_mismatches",
            "Re-proposals whose replay disagreed with their certificate",
            metrics.replay_mismatches.clone(),
        );
        metrics
    }

    pub fn inbound(&self, status: Status) {
        self.inbound.get_or_create(&StatusLabel::new(status)).inc();
    }
}
