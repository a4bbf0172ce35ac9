use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Status {
    Success,
    Missing,
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

/// Metrics for the [`Engine`](super::Engine)
pub struct Metrics {
    /// Chunk responses received, by outcome
    pub chunks: Family<StatusLabel, Counter>,
    /// Chunk requests served, by whether the chunk was held
    pub served: Family<StatusLabel, Counter>,
    /// Blobs certified as submitter
    pub certified: Counter,
    /// Blobs currently held or being fetched
    pub blobs: Gauge,
}

impl Metrics {
    pub fn init(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            chunks: Family::default(),
            served: Family::default(),
            certified: Counter::default(),
            blobs: Gauge::default(),
        };
        let mut registry = registry.lock().unwrap();
        let registry = registry.sub_registry_with_prefix("blobs");
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
        registry.register(
            "certified",
            "Blobs certified as submitter",
            metrics.certified.clone(),
        );
        registry.register(
            "blobs",
            "Blobs currently held or being fetched",
            metrics.blobs.clone(),
        );
        metrics
    }
}
