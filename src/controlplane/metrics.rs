//! Operator metrics
//!
//! Prometheus collectors for the reconcile loop, held in a dedicated
//! registry and rendered in the text exposition format by the metrics server.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::time::Duration;

use crate::error::Result;

/// Reconcile result label for successful passes
pub const RESULT_SUCCESS: &str = "success";

/// Reconcile result label for passes waiting on an external actor
pub const RESULT_WAITING: &str = "waiting";

/// Reconcile result label for failed passes
pub const RESULT_ERROR: &str = "error";

/// Prometheus collectors of the operator
pub struct OperatorMetrics {
    registry: Registry,
    /// Reconcile passes by result
    pub reconciliations: IntCounterVec,
    /// Wall time of the resource unit fan-out
    pub reconcile_duration: Histogram,
    /// Resource unit failures by unit
    pub unit_failures: IntCounterVec,
    /// 1 while the LVMCluster reports Ready
    pub cluster_ready: IntGauge,
}

impl OperatorMetrics {
    /// Create the collectors and register them
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("lvms_operator".to_string()), None)?;

        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations_total", "Reconcile passes by result"),
            &["result"],
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new(
                "reconcile_duration_seconds",
                "Duration of the resource unit fan-out",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        )?;
        let unit_failures = IntCounterVec::new(
            Opts::new("unit_failures_total", "Resource unit failures by unit"),
            &["unit"],
        )?;
        let cluster_ready = IntGauge::new("cluster_ready", "Whether the LVMCluster is Ready")?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(unit_failures.clone()))?;
        registry.register(Box::new(cluster_ready.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            reconcile_duration,
            unit_failures,
            cluster_ready,
        })
    }

    /// Count one reconcile pass
    pub fn record_reconcile(&self, result: &str) {
        self.reconciliations.with_label_values(&[result]).inc();
    }

    /// Record the wall time of a fan-out
    pub fn observe_duration(&self, elapsed: Duration) {
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    /// Count a failed resource unit
    pub fn record_unit_failure(&self, unit: &str) {
        self.unit_failures.with_label_values(&[unit]).inc();
    }

    /// Track the cluster readiness
    pub fn set_ready(&self, ready: bool) {
        self.cluster_ready.set(i64::from(ready));
    }

    /// Render every collector in the Prometheus text format
    pub fn render(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_collectors() {
        let metrics = OperatorMetrics::new().unwrap();
        metrics.record_reconcile(RESULT_SUCCESS);
        metrics.record_unit_failure("vg-manager");
        metrics.observe_duration(Duration::from_millis(120));
        metrics.set_ready(true);

        let (content_type, body) = metrics.render().unwrap();
        let text = String::from_utf8(body).unwrap();

        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("lvms_operator_reconciliations_total{result=\"success\"} 1"));
        assert!(text.contains("lvms_operator_unit_failures_total{unit=\"vg-manager\"} 1"));
        assert!(text.contains("lvms_operator_cluster_ready 1"));
        assert!(text.contains("lvms_operator_reconcile_duration_seconds_count 1"));
    }

    #[test]
    fn test_registries_are_independent() {
        let a = OperatorMetrics::new().unwrap();
        let b = OperatorMetrics::new().unwrap();
        a.record_reconcile(RESULT_ERROR);

        let (_, body) = b.render().unwrap();
        assert!(!String::from_utf8(body).unwrap().contains("result=\"error\""));
    }
}
