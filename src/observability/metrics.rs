//! Context-flow metrics aggregation and exposition.
//!
//! # Responsibilities
//! - Accumulate raw counters for the in-process summary
//! - Forward every recording to the `metrics` facade (Prometheus sink)
//! - Derive preservation rate, peak lineage depth and active contexts
//!
//! # Metrics
//! - `context_flow_snapshots_total` (counter): snapshots by stage
//! - `context_flow_mutations_total` (counter): field changes by type, stage
//! - `context_flow_errors_total` (counter): pipeline errors by type, stage
//! - `context_flow_stage_latency_seconds` (histogram): stage latency
//! - `context_flow_active_contexts` (gauge): in-flight contexts
//! - `context_flow_max_lineage_depth` (gauge): peak lineage length
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Gauges use CAS loops so concurrent updates never regress or go negative

use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::context::ChangeType;

/// Initialize the Prometheus exporter on the given address.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Prometheus exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install Prometheus exporter"),
    }
}

/// Point-in-time view of accumulated context-flow statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextMetricsSummary {
    pub total_contexts_processed: u64,
    pub contexts_preserved_successfully: u64,
    pub preservation_rate: f64,
    pub active_contexts: i64,
    pub max_lineage_depth: usize,
    pub total_mutations: u64,
    pub total_errors: u64,
    pub total_validation_failures: u64,
    pub total_boundary_crossings: u64,
    pub size_threshold_exceeded: u64,
    pub total_anomalies: u64,
    pub timestamp: DateTime<Utc>,
}

/// Aggregates recordings from the tracker, middleware and diagnostics.
#[derive(Debug, Default)]
pub struct ContextFlowMetrics {
    total_processed: AtomicU64,
    preserved: AtomicU64,
    mutations: AtomicU64,
    errors: AtomicU64,
    validation_failures: AtomicU64,
    boundary_crossings: AtomicU64,
    size_exceeded: AtomicU64,
    anomalies: AtomicU64,
    active_contexts: AtomicI64,
    max_lineage_depth: AtomicUsize,
}

impl ContextFlowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a captured snapshot.
    pub fn record_snapshot(&self, stage: &str, field_count: usize, size_bytes: usize) {
        self.total_processed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("context_flow_snapshots_total", "stage" => stage.to_string()).increment(1);
        metrics::histogram!("context_flow_snapshot_fields").record(field_count as f64);
        metrics::histogram!("context_flow_snapshot_size_bytes").record(size_bytes as f64);
    }

    pub fn record_mutation(&self, change_type: ChangeType, stage: &str) {
        self.mutations.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "context_flow_mutations_total",
            "change_type" => change_type.as_str(),
            "stage" => stage.to_string()
        )
        .increment(1);
    }

    pub fn record_error(&self, error_type: &str, stage: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(
            "context_flow_errors_total",
            "error_type" => error_type.to_string(),
            "stage" => stage.to_string()
        )
        .increment(1);
    }

    pub fn record_validation_failure(&self, reason: &str) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("context_flow_validation_failures_total", "reason" => reason.to_string())
            .increment(1);
    }

    pub fn record_boundary_crossing(&self, service: &str) {
        self.boundary_crossings.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("context_flow_boundary_crossings_total", "service" => service.to_string())
            .increment(1);
    }

    pub fn record_preservation_success(&self, stage: &str) {
        self.preserved.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("context_flow_preserved_total", "stage" => stage.to_string()).increment(1);
    }

    pub fn record_size_threshold_exceeded(&self, stage: &str, size_bytes: usize) {
        self.size_exceeded.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("context_flow_size_threshold_exceeded_total", "stage" => stage.to_string())
            .increment(1);
        metrics::histogram!("context_flow_oversized_context_bytes").record(size_bytes as f64);
    }

    pub fn record_stage_latency(&self, stage: &str, elapsed: Duration) {
        metrics::histogram!("context_flow_stage_latency_seconds", "stage" => stage.to_string())
            .record(elapsed.as_secs_f64());
    }

    pub fn record_serialization_latency(&self, operation: &str, elapsed: Duration) {
        metrics::histogram!(
            "context_flow_serialization_latency_seconds",
            "operation" => operation.to_string()
        )
        .record(elapsed.as_secs_f64());
    }

    pub fn record_anomaly(&self, anomaly_type: &str) {
        self.anomalies.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("context_flow_anomalies_total", "type" => anomaly_type.to_string())
            .increment(1);
    }

    /// Apply a delta to the active-context count, flooring at zero.
    pub fn update_active_context_count(&self, delta: i64) {
        let mut prev = self.active_contexts.load(Ordering::Relaxed);
        let next = loop {
            let next = prev.saturating_add(delta).max(0);
            match self.active_contexts.compare_exchange_weak(
                prev, next, Ordering::Relaxed, Ordering::Relaxed
            ) {
                Ok(_) => break next,
                Err(x) => prev = x,
            }
        };
        metrics::gauge!("context_flow_active_contexts").set(next as f64);
    }

    /// Offer a lineage depth; the reported maximum never decreases.
    pub fn update_lineage_depth(&self, depth: usize) {
        let mut prev = self.max_lineage_depth.load(Ordering::Relaxed);
        loop {
            if depth <= prev {
                return;
            }
            match self.max_lineage_depth.compare_exchange_weak(
                prev, depth, Ordering::Relaxed, Ordering::Relaxed
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        metrics::gauge!("context_flow_max_lineage_depth").set(depth as f64);
    }

    /// Compute the current summary.
    pub fn get_metrics_summary(&self) -> ContextMetricsSummary {
        let total = self.total_processed.load(Ordering::Relaxed);
        let preserved = self.preserved.load(Ordering::Relaxed);
        let preservation_rate = if total == 0 {
            1.0
        } else {
            preserved as f64 / total.max(1) as f64
        };

        ContextMetricsSummary {
            total_contexts_processed: total,
            contexts_preserved_successfully: preserved,
            preservation_rate,
            active_contexts: self.active_contexts.load(Ordering::Relaxed),
            max_lineage_depth: self.max_lineage_depth.load(Ordering::Relaxed),
            total_mutations: self.mutations.load(Ordering::Relaxed),
            total_errors: self.errors.load(Ordering::Relaxed),
            total_validation_failures: self.validation_failures.load(Ordering::Relaxed),
            total_boundary_crossings: self.boundary_crossings.load(Ordering::Relaxed),
            size_threshold_exceeded: self.size_exceeded.load(Ordering::Relaxed),
            total_anomalies: self.anomalies.load(Ordering::Relaxed),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_default_preservation_rate() {
        let metrics = ContextFlowMetrics::new();
        let summary = metrics.get_metrics_summary();
        assert_eq!(summary.preservation_rate, 1.0);
        assert_eq!(summary.total_contexts_processed, 0);
    }

    #[test]
    fn test_preservation_rate_arithmetic() {
        let metrics = ContextFlowMetrics::new();
        for _ in 0..3 {
            metrics.record_snapshot("Handler", 6, 128);
        }
        metrics.record_preservation_success("Handler");

        let rate = metrics.get_metrics_summary().preservation_rate;
        assert!((rate - 1.0 / 3.0).abs() < 0.001);
    }

    #[test]
    fn test_active_count_floors_at_zero() {
        let metrics = ContextFlowMetrics::new();
        metrics.update_active_context_count(2);
        for _ in 0..5 {
            metrics.update_active_context_count(-1);
        }
        assert_eq!(metrics.get_metrics_summary().active_contexts, 0);

        metrics.update_active_context_count(1);
        assert_eq!(metrics.get_metrics_summary().active_contexts, 1);
    }

    #[test]
    fn test_lineage_depth_is_monotonic_peak() {
        let metrics = ContextFlowMetrics::new();
        metrics.update_lineage_depth(3);
        metrics.update_lineage_depth(7);
        metrics.update_lineage_depth(5);
        assert_eq!(metrics.get_metrics_summary().max_lineage_depth, 7);
    }

    #[test]
    fn test_concurrent_depth_updates_never_regress() {
        let metrics = Arc::new(ContextFlowMetrics::new());
        let handles: Vec<_> = (1..=8)
            .map(|t| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for d in 0..100 {
                        metrics.update_lineage_depth(t * 100 + d);
                        metrics.update_active_context_count(-1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let summary = metrics.get_metrics_summary();
        assert_eq!(summary.max_lineage_depth, 899);
        assert_eq!(summary.active_contexts, 0);
    }

    #[test]
    fn test_counters_accumulate() {
        let metrics = ContextFlowMetrics::new();
        metrics.record_mutation(ChangeType::Added, "Handler");
        metrics.record_error("pipeline_exception", "Handler");
        metrics.record_validation_failure("missing_required_fields");
        metrics.record_boundary_crossing("billing");
        metrics.record_size_threshold_exceeded("Handler", 4096);

        let summary = metrics.get_metrics_summary();
        assert_eq!(summary.total_mutations, 1);
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.total_validation_failures, 1);
        assert_eq!(summary.total_boundary_crossings, 1);
        assert_eq!(summary.size_threshold_exceeded, 1);
    }
}
