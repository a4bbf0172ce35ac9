use prometheus_client::{
    encoding::{EncodeLabelSet, EncodeLabelValue},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Status {
    Success,
    Failure,
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

pub struct Metrics {
    /// Requests created, by whether an eligible participant was found.
    pub created: Family<StatusLabel, Counter>,

    /// Requests completed, by outcome.
    pub requests: Family<StatusLabel, Counter>,

    /// Participants currently excluded.
    pub excluded: Gauge,
}

impl Metrics {
    pub fn init(registry: &Arc<Mutex<Registry>>, prefix: &str) -> Self {
        let metrics = Self {
            created: Family::default(),
            requests: Family::default(),
            excluded: Gauge::default(),
        };
        let mut registry = registry.lock().unwrap();
        let registry = registry.sub_registry_with_prefix(prefix);
        registry.register(
            "created",
            "Number of requests created",
            metrics.created.clone(),
        );
        registry.register(
            "requests",
            "Number of requests completed",
            metrics.requests.clone(),
        );
        registry.register(
            "excluded",
            "Number of participants currently excluded",
            metrics.excluded.clone(),
        );
        metrics
    }
}
