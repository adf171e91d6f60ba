//! Anomaly detection, health analysis and history tracking.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::ContextFlowConfig;
use crate::context::{
    AuthorizationResult, MessageContext, ValidationResult, AUTHORIZATION_RESULT_KEY,
    STAGE_ITEM_KEY, VALIDATION_RESULT_KEY,
};
use crate::diagnostics::types::{
    AnomalySeverity, AnomalyType, ContextAnomaly, ContextDiagnosticIssue, ContextHistory,
    ContextHistoryEvent, IssueCategory, IssueSeverity,
};
use crate::error::{require_arg, ContextFlowResult};
use crate::lifecycle::{spawn_sweeper, CancellationToken};
use crate::observability::metrics::ContextFlowMetrics;
use crate::observability::sanitizer::compile_patterns;
use crate::tracking::ContextFlowTracker;

/// Fewer populated fields than this is insufficient context.
pub const MIN_CONTEXT_FIELDS: usize = 5;

/// More populated fields than this is excessive context.
pub const MAX_CONTEXT_FIELDS: usize = 100;

/// Largest acceptable serialized custom item.
pub const MAX_ITEM_SIZE_BYTES: usize = 10 * 1024;

/// Messages sent longer ago than this are stale.
pub const STALE_MESSAGE_THRESHOLD_SECS: i64 = 300;

/// Delivery counts above this are flagged.
pub const HIGH_DELIVERY_COUNT: u32 = 3;

type Histories = DashMap<String, ContextHistory>;

/// Mines tracked context flow for problems and keeps per-message history.
pub struct ContextFlowDiagnostics {
    pub(crate) tracker: Arc<ContextFlowTracker>,
    pub(crate) metrics: Arc<ContextFlowMetrics>,
    pub(crate) config: Arc<ContextFlowConfig>,
    pub(crate) anomalies: Mutex<VecDeque<ContextAnomaly>>,
    pub(crate) histories: Arc<Histories>,
    sensitive_patterns: Vec<Regex>,
    cancel: CancellationToken,
    cleanup: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ContextFlowDiagnostics {
    /// Create diagnostics over `tracker`; starts the history sweeper when inside a runtime.
    pub fn new(
        tracker: Arc<ContextFlowTracker>,
        metrics: Arc<ContextFlowMetrics>,
        config: Arc<ContextFlowConfig>,
    ) -> Self {
        let histories: Arc<Histories> = Arc::new(DashMap::new());
        let cancel = CancellationToken::new();

        let weak: Weak<Histories> = Arc::downgrade(&histories);
        let retention = config.diagnostics.history_retention();
        let cleanup = spawn_sweeper(
            "context_history",
            config.tracker.cleanup_interval(),
            cancel.clone(),
            move || {
                weak.upgrade().map_or(0, |histories| {
                    sweep_histories(&histories, Utc::now(), retention)
                })
            },
        );

        Self {
            sensitive_patterns: compile_patterns(&config.fields.sensitive_patterns),
            tracker,
            metrics,
            config,
            anomalies: Mutex::new(VecDeque::new()),
            histories,
            cancel,
            cleanup: Mutex::new(cleanup),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn tracker(&self) -> &Arc<ContextFlowTracker> {
        &self.tracker
    }

    /// Run every anomaly rule against `context`.
    ///
    /// Each hit is also pushed onto the recent-anomaly ring.
    pub fn detect_anomalies(&self, context: &MessageContext) -> Vec<ContextAnomaly> {
        let message_id = context.message_id.clone().unwrap_or_default();
        let mut found = Vec::new();
        let mut flag = |anomaly_type, severity, description: String, action: &str| {
            found.push(ContextAnomaly {
                anomaly_type,
                severity,
                description,
                message_id: message_id.clone(),
                detected_at: Utc::now(),
                suggested_action: Some(action.to_string()),
            });
        };

        let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
        if context.delivery_count > 1 && blank(&context.correlation_id) && blank(&context.causation_id) {
            flag(
                AnomalyType::MissingCorrelation,
                AnomalySeverity::Medium,
                format!(
                    "Redelivered message (delivery {}) carries neither correlation nor causation id",
                    context.delivery_count
                ),
                "Propagate the correlation id from the originating request",
            );
        }

        if !message_id.is_empty() && context.causation_id.as_deref() == Some(message_id.as_str()) {
            flag(
                AnomalyType::CircularCausation,
                AnomalySeverity::High,
                format!("Message {} lists itself as its cause", message_id),
                "Set the causation id to the id of the triggering message",
            );
        }

        let populated = context.populated_field_count();
        if populated < MIN_CONTEXT_FIELDS {
            flag(
                AnomalyType::InsufficientContext,
                AnomalySeverity::Low,
                format!("Only {} context fields populated (minimum {})", populated, MIN_CONTEXT_FIELDS),
                "Populate correlation, tenant and message type fields",
            );
        } else if populated > MAX_CONTEXT_FIELDS {
            flag(
                AnomalyType::ExcessiveContext,
                AnomalySeverity::Medium,
                format!("{} context fields populated (maximum {})", populated, MAX_CONTEXT_FIELDS),
                "Move bulky state out of the message context",
            );
        }

        for (key, value) in context.custom_items() {
            if self.sensitive_patterns.iter().any(|p| p.is_match(key)) {
                flag(
                    AnomalyType::PotentialPii,
                    AnomalySeverity::High,
                    format!("Custom item `{}` looks like personal data", key),
                    "Remove the item or reference the data by an opaque id",
                );
            }

            let size = estimate_item_size(key, value);
            if size > MAX_ITEM_SIZE_BYTES {
                flag(
                    AnomalyType::OversizedItem,
                    AnomalySeverity::Medium,
                    format!("Custom item `{}` is {} bytes (maximum {})", key, size, MAX_ITEM_SIZE_BYTES),
                    "Store large payloads externally and pass a reference",
                );
            }
        }

        for anomaly in &found {
            self.remember(anomaly.clone());
        }
        found
    }

    fn remember(&self, anomaly: ContextAnomaly) {
        self.metrics.record_anomaly(anomaly.anomaly_type.as_str());
        match anomaly.severity {
            AnomalySeverity::High => tracing::warn!(
                message_id = %anomaly.message_id,
                anomaly = %anomaly.anomaly_type,
                "{}", anomaly.description
            ),
            _ => tracing::debug!(
                message_id = %anomaly.message_id,
                anomaly = %anomaly.anomaly_type,
                "{}", anomaly.description
            ),
        }
        if self.is_disposed() {
            return;
        }

        let capacity = self.config.diagnostics.max_anomaly_queue_size.max(1);
        let mut queue = self.anomalies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.push_back(anomaly);
        while queue.len() > capacity {
            queue.pop_front();
        }
    }

    /// Health findings for `context`. Nothing is stored.
    pub fn analyze_context_health(&self, context: &MessageContext) -> Vec<ContextDiagnosticIssue> {
        self.analyze_context_health_at(context, Utc::now())
    }

    pub(crate) fn analyze_context_health_at(
        &self,
        context: &MessageContext,
        now: DateTime<Utc>,
    ) -> Vec<ContextDiagnosticIssue> {
        let mut issues = Vec::new();

        for field in self.tracker.missing_required_fields(context) {
            issues.push(ContextDiagnosticIssue {
                severity: IssueSeverity::Warning,
                category: IssueCategory::MissingField,
                description: format!("Required field `{}` is missing", field),
                recommendation: Some(format!("Set `{}` before dispatching", field)),
                field: Some(field),
            });
        }

        if let Some(sent_at) = context.sent_at {
            let age = now - sent_at;
            if age > chrono::Duration::seconds(STALE_MESSAGE_THRESHOLD_SECS) {
                issues.push(ContextDiagnosticIssue {
                    severity: IssueSeverity::Warning,
                    category: IssueCategory::StaleMessage,
                    description: format!("Message was sent {}s ago", age.num_seconds()),
                    field: Some("SentAt".to_string()),
                    recommendation: Some("Check consumer lag and queue backlog".to_string()),
                });
            }
        }

        if context.delivery_count > HIGH_DELIVERY_COUNT {
            issues.push(ContextDiagnosticIssue {
                severity: IssueSeverity::Warning,
                category: IssueCategory::HighDeliveryCount,
                description: format!("Message delivered {} times", context.delivery_count),
                field: Some("DeliveryCount".to_string()),
                recommendation: Some("Inspect handler failures; consider dead-lettering".to_string()),
            });
        }

        if let Some(result) = context.try_get::<ValidationResult>(VALIDATION_RESULT_KEY) {
            if !result.is_valid {
                issues.push(ContextDiagnosticIssue {
                    severity: IssueSeverity::Error,
                    category: IssueCategory::ValidationFailure,
                    description: if result.errors.is_empty() {
                        "Message failed validation".to_string()
                    } else {
                        format!("Message failed validation: {}", result.errors.join("; "))
                    },
                    field: None,
                    recommendation: Some("Fix the producer's payload".to_string()),
                });
            }
        }

        if let Some(result) = context.try_get::<AuthorizationResult>(AUTHORIZATION_RESULT_KEY) {
            if !result.is_authorized {
                issues.push(ContextDiagnosticIssue {
                    severity: IssueSeverity::Error,
                    category: IssueCategory::AuthorizationFailure,
                    description: match result.reason {
                        Some(reason) => format!("Authorization denied: {}", reason),
                        None => "Authorization denied".to_string(),
                    },
                    field: None,
                    recommendation: Some("Verify the caller's grants for this message type".to_string()),
                });
            }
        }

        let size = estimate_context_size(context);
        let max = self.config.middleware.max_context_size_bytes;
        if size > max {
            issues.push(ContextDiagnosticIssue {
                severity: IssueSeverity::Warning,
                category: IssueCategory::OversizedContext,
                description: format!("Context is {} bytes (maximum {})", size, max),
                field: None,
                recommendation: Some("Trim custom items".to_string()),
            });
        }

        issues
    }

    /// Append an event to the message's history.
    pub fn track_context_history(
        &self,
        context: &MessageContext,
        event_type: &str,
        details: Option<&str>,
    ) -> ContextFlowResult<()> {
        require_arg(event_type, "event_type")?;
        if self.is_disposed() {
            return Ok(());
        }

        let message_id = context
            .message_id
            .clone()
            .unwrap_or_else(|| format!("unknown-{}", Uuid::new_v4()));
        let event = ContextHistoryEvent {
            event_type: event_type.to_string(),
            details: details.map(str::to_string),
            stage: context
                .item(STAGE_ITEM_KEY)
                .and_then(|v| v.as_str())
                .map(str::to_string),
            timestamp: Utc::now(),
            thread_id: format!("{:?}", std::thread::current().id()),
            field_count: context.populated_field_count(),
            size_bytes: estimate_context_size(context),
        };

        let max = self.config.diagnostics.max_history_events_per_message;
        self.histories
            .entry(message_id.clone())
            .or_insert_with(|| ContextHistory::new(message_id))
            .push(event, max);
        Ok(())
    }

    pub fn get_context_history(&self, message_id: &str) -> Option<ContextHistory> {
        self.histories.get(message_id).map(|r| r.value().clone())
    }

    /// Up to `limit` anomalies, most recent first.
    pub fn get_recent_anomalies(&self, limit: usize) -> Vec<ContextAnomaly> {
        let queue = self.anomalies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        queue.iter().rev().take(limit).cloned().collect()
    }

    /// Drop histories idle past the retention window.
    pub fn cleanup_expired(&self) -> usize {
        sweep_histories(&self.histories, Utc::now(), self.config.diagnostics.history_retention())
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Release the anomaly ring and history map. Later calls are no-ops.
    pub fn dispose(&self) {
        if let Some(handle) = self.begin_dispose() {
            handle.abort();
        }
    }

    pub async fn dispose_async(&self) {
        if let Some(handle) = self.begin_dispose() {
            let _ = handle.await;
        }
    }

    fn begin_dispose(&self) -> Option<JoinHandle<()>> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return None;
        }
        self.cancel.cancel();
        self.anomalies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.histories.clear();
        tracing::debug!("Context flow diagnostics disposed");
        self.cleanup
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

impl Drop for ContextFlowDiagnostics {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn sweep_histories(histories: &Histories, now: DateTime<Utc>, retention: std::time::Duration) -> usize {
    let retention = chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::hours(1));
    let cutoff = now - retention;
    let before = histories.len();
    histories.retain(|_, history| history.last_activity() >= cutoff);
    before.saturating_sub(histories.len())
}

/// Serialized size of one custom item.
pub(crate) fn estimate_item_size(key: &str, value: &serde_json::Value) -> usize {
    key.len() + serde_json::to_vec(value).map_or(0, |v| v.len())
}

/// Serialized size of the whole context.
pub(crate) fn estimate_context_size(context: &MessageContext) -> usize {
    serde_json::to_vec(context).map_or(0, |v| v.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn diagnostics_with(config: ContextFlowConfig) -> ContextFlowDiagnostics {
        let config = Arc::new(config);
        let metrics = Arc::new(ContextFlowMetrics::new());
        let tracker = Arc::new(ContextFlowTracker::new(config.clone(), metrics.clone()));
        ContextFlowDiagnostics::new(tracker, metrics, config)
    }

    fn diagnostics() -> ContextFlowDiagnostics {
        diagnostics_with(ContextFlowConfig::default())
    }

    fn rich_context(id: &str) -> MessageContext {
        MessageContext::new(id)
            .with_correlation_id("c-1")
            .with_causation_id("m-0")
            .with_message_type("OrderPlaced")
            .with_tenant_id("tenant-a")
    }

    fn types(anomalies: &[ContextAnomaly]) -> Vec<AnomalyType> {
        anomalies.iter().map(|a| a.anomaly_type).collect()
    }

    #[test]
    fn test_missing_correlation_on_redelivery() {
        let d = diagnostics();
        let ctx = MessageContext::new("m-1").with_delivery_count(3);
        assert!(types(&d.detect_anomalies(&ctx)).contains(&AnomalyType::MissingCorrelation));

        let ctx = MessageContext::new("m-1").with_delivery_count(1);
        assert!(!types(&d.detect_anomalies(&ctx)).contains(&AnomalyType::MissingCorrelation));
    }

    #[test]
    fn test_circular_causation() {
        let d = diagnostics();
        let ctx = rich_context("m-1").with_causation_id("m-1");
        let found = types(&d.detect_anomalies(&ctx));
        assert_eq!(found, vec![AnomalyType::CircularCausation]);
    }

    #[test]
    fn test_field_count_bounds() {
        let d = diagnostics();
        let found = types(&d.detect_anomalies(&MessageContext::new("m-1")));
        assert!(found.contains(&AnomalyType::InsufficientContext));

        assert!(d.detect_anomalies(&rich_context("m-2")).is_empty());

        let mut ctx = rich_context("m-3");
        for i in 0..120 {
            ctx.set_item(format!("k{}", i), i);
        }
        assert_eq!(types(&d.detect_anomalies(&ctx)), vec![AnomalyType::ExcessiveContext]);
    }

    #[test]
    fn test_pii_and_oversized_items() {
        let d = diagnostics();
        let ctx = rich_context("m-1")
            .with_item("CustomerEmail", "someone")
            .with_item("Blob", "x".repeat(11 * 1024));
        let found = types(&d.detect_anomalies(&ctx));
        assert!(found.contains(&AnomalyType::PotentialPii));
        assert!(found.contains(&AnomalyType::OversizedItem));

        // Value content is not inspected.
        let ctx = rich_context("m-2").with_item("Note", "contact me at a@b.c");
        assert!(d.detect_anomalies(&ctx).is_empty());
    }

    #[test]
    fn test_anomaly_ring_is_bounded_most_recent_first() {
        let mut config = ContextFlowConfig::default();
        config.diagnostics.max_anomaly_queue_size = 3;
        let d = diagnostics_with(config);

        for i in 0..5 {
            let id = format!("m-{}", i);
            d.detect_anomalies(&rich_context(&id).with_causation_id(id.clone()));
        }
        let recent = d.get_recent_anomalies(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message_id, "m-4");
        assert_eq!(recent[2].message_id, "m-2");
        assert_eq!(d.get_recent_anomalies(1).len(), 1);
    }

    #[test]
    fn test_health_issues() {
        let mut config = ContextFlowConfig::default();
        config.fields.required_fields = vec!["MessageId".into(), "CorrelationId".into()];
        config.middleware.max_context_size_bytes = 10_000;
        let d = diagnostics_with(config);

        let ctx = MessageContext::new("m-1")
            .with_sent_at(Utc::now() - chrono::Duration::minutes(30))
            .with_delivery_count(5)
            .with_item(VALIDATION_RESULT_KEY, json!({ "is_valid": false, "errors": ["amount"] }))
            .with_item(AUTHORIZATION_RESULT_KEY, json!({ "is_authorized": false, "reason": "no grant" }))
            .with_item("Blob", "x".repeat(20_000));

        let issues = d.analyze_context_health(&ctx);
        let categories: Vec<_> = issues.iter().map(|i| i.category).collect();
        assert_eq!(
            categories,
            vec![
                IssueCategory::MissingField,
                IssueCategory::StaleMessage,
                IssueCategory::HighDeliveryCount,
                IssueCategory::ValidationFailure,
                IssueCategory::AuthorizationFailure,
                IssueCategory::OversizedContext,
            ]
        );
        assert_eq!(issues[0].field.as_deref(), Some("CorrelationId"));
        assert_eq!(issues[3].severity, IssueSeverity::Error);

        let healthy = rich_context("m-2").with_item(VALIDATION_RESULT_KEY, json!({ "is_valid": true }));
        assert!(d.analyze_context_health(&healthy).is_empty());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut config = ContextFlowConfig::default();
        config.diagnostics.max_history_events_per_message = 5;
        let d = diagnostics_with(config);
        let ctx = rich_context("m-1");

        for i in 0..8 {
            d.track_context_history(&ctx, &format!("event-{}", i), None).unwrap();
        }
        let history = d.get_context_history("m-1").unwrap();
        assert_eq!(history.events.len(), 5);
        assert_eq!(history.events.front().unwrap().event_type, "event-3");
        assert_eq!(history.events.back().unwrap().event_type, "event-7");
        assert!(d.get_context_history("m-unknown").is_none());
        assert!(d.track_context_history(&ctx, "", None).is_err());
    }

    #[test]
    fn test_history_without_message_id_gets_generated_key() {
        let d = diagnostics();
        d.track_context_history(&MessageContext::default(), "received", Some("no id"))
            .unwrap();
        assert_eq!(d.histories.len(), 1);
        assert!(d.histories.iter().all(|r| r.key().starts_with("unknown-")));
    }

    #[test]
    fn test_history_sweep() {
        let d = diagnostics();
        d.track_context_history(&rich_context("m-1"), "received", None).unwrap();
        assert_eq!(d.cleanup_expired(), 0);
        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(sweep_histories(&d.histories, later, std::time::Duration::from_secs(3600)), 1);
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let d = diagnostics();
        d.detect_anomalies(&MessageContext::new("m-1"));
        d.dispose();
        d.dispose();
        assert!(d.get_recent_anomalies(10).is_empty());
    }

    #[tokio::test]
    async fn test_dispose_async_is_idempotent() {
        let d = diagnostics();
        d.dispose_async().await;
        d.dispose_async().await;
        assert!(d.is_disposed());
    }
}
