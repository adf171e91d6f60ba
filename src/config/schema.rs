//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the engine.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the context-flow engine.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ContextFlowConfig {
    /// Pipeline middleware policy.
    pub middleware: MiddlewareConfig,

    /// Snapshot and lineage tracking limits.
    pub tracker: TrackerConfig,

    /// Anomaly queue and history limits.
    pub diagnostics: DiagnosticsConfig,

    /// Trace span enrichment.
    pub enricher: EnricherConfig,

    /// Field lists driving validation, capture and sanitization.
    pub fields: FieldPolicyConfig,

    /// Logging and metrics exporter settings.
    pub telemetry: TelemetryConfig,
}

/// Middleware policy configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MiddlewareConfig {
    /// Global switch; when off the middleware is a hard bypass.
    pub enabled: bool,

    /// Check required fields before invoking the next stage.
    pub validate_context_integrity: bool,

    /// Abort the pipeline when required fields are missing.
    pub fail_on_integrity_violation: bool,

    /// Abort the pipeline when the context exceeds `max_context_size_bytes`.
    pub fail_on_size_violation: bool,

    /// Maximum estimated context size.
    pub max_context_size_bytes: usize,

    /// Persist detected mutations back onto the context.
    pub store_mutations_in_context: bool,

    /// Record an error snapshot when the next stage fails.
    pub capture_error_states: bool,

    /// Attach a stack trace to error snapshots.
    pub include_stack_traces: bool,

    /// Add span events for violations and critical mutations.
    pub emit_diagnostic_events: bool,

    /// Stage name used when the pipeline does not supply one.
    pub default_stage: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            validate_context_integrity: true,
            fail_on_integrity_violation: false,
            fail_on_size_violation: false,
            max_context_size_bytes: 100_000,
            store_mutations_in_context: true,
            capture_error_states: true,
            include_stack_traces: false,
            emit_diagnostic_events: true,
            default_stage: "Pipeline".to_string(),
        }
    }
}

/// Tracker configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Capture custom items into snapshots.
    pub capture_custom_items: bool,

    /// Cap on custom items captured per snapshot.
    pub max_custom_items_to_capture: usize,

    /// Lineage snapshot cap; oldest evicted first.
    pub max_snapshots_per_lineage: usize,

    /// Retention window for lineages and snapshots.
    pub snapshot_retention_secs: u64,

    /// Background sweep interval.
    pub cleanup_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            capture_custom_items: true,
            max_custom_items_to_capture: 20,
            max_snapshots_per_lineage: 100,
            snapshot_retention_secs: 3600,
            cleanup_interval_secs: 300,
        }
    }
}

impl TrackerConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.snapshot_retention_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Diagnostics configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Per-message history cap; oldest dropped first.
    pub max_history_events_per_message: usize,

    /// Recent-anomaly ring capacity.
    pub max_anomaly_queue_size: usize,

    /// Retention window for per-message histories.
    pub history_retention_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            max_history_events_per_message: 50,
            max_anomaly_queue_size: 1000,
            history_retention_secs: 3600,
        }
    }
}

impl DiagnosticsConfig {
    pub fn history_retention(&self) -> Duration {
        Duration::from_secs(self.history_retention_secs)
    }
}

/// Trace enrichment configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EnricherConfig {
    /// Add sanitized custom items as span attributes.
    pub include_custom_items: bool,

    /// Cap on custom items added to a span.
    pub max_custom_items: usize,

    /// Link the span to the parent parsed from the trace-parent field.
    pub link_parent_trace: bool,
}

impl Default for EnricherConfig {
    fn default() -> Self {
        Self {
            include_custom_items: false,
            max_custom_items: 10,
            link_parent_trace: true,
        }
    }
}

/// Field lists.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FieldPolicyConfig {
    /// Fields that must be present and non-blank.
    pub required_fields: Vec<String>,

    /// Fields whose mutation is logged loudly.
    pub critical_fields: Vec<String>,

    /// Custom items to capture; empty captures all.
    pub tracked_fields: Vec<String>,

    /// Case-insensitive regex patterns for sensitive field names.
    pub sensitive_patterns: Vec<String>,
}

impl Default for FieldPolicyConfig {
    fn default() -> Self {
        Self {
            required_fields: vec!["MessageId".to_string()],
            critical_fields: Vec::new(),
            tracked_fields: Vec::new(),
            sensitive_patterns: default_sensitive_patterns(),
        }
    }
}

fn default_sensitive_patterns() -> Vec<String> {
    [
        "e-?mail",
        "ssn",
        "social[_ .-]?security",
        "credit[_ .-]?card",
        "card[_ .-]?number",
        "password",
        "phone",
        "passport",
        "token",
        "secret",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

/// Logging and metrics exporter configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` overrides it.
    pub log_filter: String,

    /// Emit JSON log lines instead of human-readable ones.
    pub json_logs: bool,

    /// Install the Prometheus exporter.
    pub metrics_enabled: bool,

    /// Prometheus exporter bind address.
    pub metrics_address: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "context_flow=info".to_string(),
            json_logs: false,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
