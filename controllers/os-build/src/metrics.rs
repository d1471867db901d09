//! Prometheus metrics for the controller.

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// Controller metrics, registered in their own registry
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    /// Reconciliations by key kind and result
    pub reconciles: IntCounterVec,
    /// Lifecycle transitions by target phase
    pub transitions: IntCounterVec,
    pub builds_started: IntCounter,
    /// Keys waiting in the work queue
    pub queue_depth: IntGauge,
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("os_build".to_string()), None)?;

        let reconciles = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconciliations grouped by key kind and result"),
            &["kind", "result"],
        )?;
        let transitions = IntCounterVec::new(
            Opts::new("transitions_total", "Build lifecycle transitions grouped by target phase"),
            &["phase"],
        )?;
        let builds_started =
            IntCounter::new("builds_started_total", "Builder objects created")?;
        let queue_depth = IntGauge::new("queue_depth", "Keys waiting in the work queue")?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(transitions.clone()))?;
        registry.register(Box::new(builds_started.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconciles,
            transitions,
            builds_started,
            queue_depth,
        })
    }

    /// Text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_includes_prefixed_metrics() {
        let metrics = Metrics::new().unwrap();
        metrics.reconciles.with_label_values(&["build", "ok"]).inc();
        metrics.transitions.with_label_values(&["Prepared"]).inc();
        metrics.queue_depth.set(3);

        let text = metrics.encode().unwrap();

        assert!(text.contains("os_build_reconciles_total{kind=\"build\",result=\"ok\"} 1"));
        assert!(text.contains("os_build_transitions_total{phase=\"Prepared\"} 1"));
        assert!(text.contains("os_build_queue_depth 3"));
    }
}
