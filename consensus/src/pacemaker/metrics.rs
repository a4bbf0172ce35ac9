use prometheus_client::{
    metrics::{counter::Counter, gauge::Gauge},
    registry::Registry,
};
use std::sync::{Arc, Mutex};

/// Metrics for the [`Actor`](super::Actor)
pub struct Metrics {
    /// Epoch the oracle is in
    pub epoch: Gauge,
    /// Highest epoch the oracle has wished for
    pub wish: Gauge,
    /// Progress timeouts
    pub timeouts: Counter,
    /// Epochs entered
    pub epochs: Counter,
}

impl Metrics {
    pub fn init(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            epoch: Gauge::default(),
            wish: Gauge::default(),
            timeouts: Counter::default(),
            epochs: Counter::default(),
        };
        let mut registry = registry.lock().unwrap();
        let registry = registry.sub_registry_with_prefix("pacemaker");
        registry.register("epoch", "Current epoch", metrics.epoch.clone());
        registry.register("wish", "Highest epoch wished for", metrics.wish.clone());
        registry.register("timeouts", "Progress timeouts", metrics.timeouts.clone());
        registry.register("epochs", "Epochs entered", metrics.epochs.clone());
        metrics
    }
}
