//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (caps and intervals > 0)
//! - Compile sensitive-name patterns up front
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ContextFlowConfig → Result<(), Vec<ValidationError>>

use regex::RegexBuilder;
use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ContextFlowConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ContextFlowConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let positive = [
        ("middleware.max_context_size_bytes", config.middleware.max_context_size_bytes as u64),
        ("tracker.max_snapshots_per_lineage", config.tracker.max_snapshots_per_lineage as u64),
        ("tracker.snapshot_retention_secs", config.tracker.snapshot_retention_secs),
        ("tracker.cleanup_interval_secs", config.tracker.cleanup_interval_secs),
        (
            "diagnostics.max_history_events_per_message",
            config.diagnostics.max_history_events_per_message as u64,
        ),
        ("diagnostics.max_anomaly_queue_size", config.diagnostics.max_anomaly_queue_size as u64),
        ("diagnostics.history_retention_secs", config.diagnostics.history_retention_secs),
    ];
    for (field, value) in positive {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than zero"));
        }
    }

    if config.middleware.default_stage.trim().is_empty() {
        errors.push(ValidationError::new("middleware.default_stage", "must not be blank"));
    }

    for pattern in &config.fields.sensitive_patterns {
        if let Err(e) = RegexBuilder::new(pattern).case_insensitive(true).build() {
            errors.push(ValidationError::new(
                "fields.sensitive_patterns",
                format!("invalid pattern `{}`: {}", pattern, e),
            ));
        }
    }

    if config.telemetry.metrics_enabled
        && config.telemetry.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "telemetry.metrics_address",
            format!("`{}` is not a socket address", config.telemetry.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
