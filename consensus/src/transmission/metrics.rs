use prometheus_client::{metrics::counter::Counter, registry::Registry};
use std::sync::{Arc, Mutex};

/// Metrics for the [`Actor`](super::Actor)
pub struct Metrics {
    /// Reports accepted and scheduled for transmission
    pub scheduled: Counter,
    /// Reports this oracle is not scheduled to transmit, or that the plugin declined
    pub skipped: Counter,
    /// Reports handed to the transmitter
    pub transmitted: Counter,
    /// Plugin or transmitter failures
    pub failed: Counter,
}

impl Metrics {
    pub fn init(registry: &Arc<Mutex<Registry>>) -> Self {
        let metrics = Self {
            scheduled: Counter::default(),
            skipped: Counter::default(),
            transmitted: Counter::default(),
            failed: Counter::default(),
        };
        let mut registry = registry.lock().unwrap();
        let registry = registry.sub_registry_with_prefix("transmission");
        registry.register("scheduled", "Reports scheduled", metrics.scheduled.clone());
        registry.register("skipped", "Reports not transmitted", metrics.skipped.clone());
        registry.register(
            "transmitted",
            "Reports handed to the transmitter",
            metrics.transmitted.clone(),
        );
        registry.register("failed", "Failed plugin or transmitter calls", metrics.failed.clone());
        metrics
    }
}
