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
    /// Chunk responses received, by outcome
    pub chunks: Family<StatusLabel, Counter>,
    /// Chunk requests served, by outcome
    pub served: Family<StatusLabel, Counter>,
    /// Leaves written from verified chunks
    pub leaves: Counter,
    /// Current tree-sync phase (0 inactive, 1 waiting, 2 active)
    pub phase: Gauge,
    /// Completed tree-syncs
    pub synced: Counter,
}

impl Metrics {
    pub fn init(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            chunks: Family::default(),
            served: Family::default(),
            leaves: Counter::default(),
            phase: Gauge::default(),
            synced: Counter::default(),
        };
        let mut registry = registry.lock().unwrap();
        let registry = registry.sub_registry_with_prefix("tree");
        registry.register(
            "chunks",
            "Chunk responses received by outcome",
            metrics.chunks.clone(),
        );
        registry.register(
            "served",
            "Chunk requests served by outcome",
            metrics.served.clone(),
        );
        registry.register("leaves", "Leaves written from verified chunks", metrics.leaves.clone());
        registry.register("phase", "Current tree-sync phase", metrics.phase.clone());
        registry.register("synced", "Completed tree-syncs", metrics.synced.clone());
        metrics
    }
}
