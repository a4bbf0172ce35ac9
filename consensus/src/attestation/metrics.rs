use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Status {
    Processed,
    /// Outside the window of blocks being attested.
    Dropped,
    Invalid,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StatusLabel {
    pub status: Status,
}

/// Metrics for the [`Actor`](super::Actor)
pub struct Metrics {
    /// Inbound signature messages by outcome
    pub inbound: Family<StatusLabel, Counter>,
    /// Reports that reached a quorum of signatures
    pub attested: Counter,
    /// Calls to the plugin's `reports` that failed
    pub failed: Counter,
    /// Blocks awaiting signatures
    pub pending: Gauge,
}

impl Metrics {
    pub fn init(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            inbound: Family::default(),
            attested: Counter::default(),
            failed: Counter::default(),
            pending: Gauge::default(),
        };
        let mut registry = registry.lock().unwrap();
        let registry = registry.sub_registry_with_prefix("attestation");
        registry.register(
            "inbound",
            "Inbound signature messages by outcome",
            metrics.inbound.clone(),
        );
        registry.register(
            "attested",
            "Reports that reached a quorum of signatures",
            metrics.attested.clone(),
        );
        registry.register("failed", "Failed report expansions", metrics.failed.clone());
        registry.register("pending", "Blocks awaiting signatures", metrics.pending.clone());
        metrics
    }

    pub fn inbound(&self, status: Status) {
        self.inbound.get_or_create(&StatusLabel { status }).inc();
    }
}
