use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Status {
    Success,
    GoAway,
    Invalid,
    Timeout,
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
    /// Block-sync responses received, by outcome
    pub responses: Family<StatusLabel, Counter>,
    /// Block-sync requests served, by whether any block was held
    pub served: Family<StatusLabel, Counter>,
    /// Blocks applied by replay
    pub replayed: Counter,
    /// Highest committed sequence number
    pub committed: Gauge,
}

impl Metrics {
    pub fn init(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            responses: Family::default(),
            served: Family::default(),
            replayed: Counter::default(),
            committed: Gauge::default(),
        };
        let mut registry = registry.lock().unwrap();
        let registry = registry.sub_registry_with_prefix("blocks");
        registry.register(
            "responses",
            "Block-sync responses received by outcome",
            metrics.responses.clone(),
        );
        registry.register(
            "served",
            "Block-sync requests served by outcome",
            metrics.served.clone(),
        );
        registry.register("replayed", "Blocks applied by replay", metrics.replayed.clone());
        registry.register(
            "committed",
            "Highest committed sequence number",
            metrics.committed.clone(),
        );
        metrics
    }
}
