//! Context observability middleware.
//!
//! # Responsibilities
//! - Snapshot context before, after and on failure of the next stage
//! - Enforce integrity and size policy (fail closed or record and proceed)
//! - Enrich the active span and feed the metrics aggregator
//! - Persist detected mutations back onto the context

use futures_util::future::BoxFuture;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

use crate::config::ContextFlowConfig;
use crate::context::{ContextChange, MessageContext, MUTATIONS_ITEM_KEY, STAGE_ITEM_KEY};
use crate::error::ContextFlowError;
use crate::lifecycle::CancellationToken;
use crate::observability::enricher::ContextTraceEnricher;
use crate::observability::metrics::ContextFlowMetrics;
use crate::observability::tracing::{ActiveSpan, AttributeValue, EventAttributes, TracingSpan};
use crate::tracking::ContextFlowTracker;

pub const EVENT_INTEGRITY_FAILED: &str = "context.integrity_failed";
pub const EVENT_SIZE_EXCEEDED: &str = "context.size_exceeded";
pub const EVENT_PIPELINE_ERROR: &str = "context.pipeline_error";
pub const EVENT_CRITICAL_FIELD_MUTATED: &str = "context.critical_field_mutated";

/// Supplies the span the middleware enriches.
pub trait SpanSource: Send + Sync {
    fn active_span(&self) -> Option<Arc<dyn ActiveSpan>>;
}

/// Uses whatever `tracing` span is current.
#[derive(Debug, Default, Clone, Copy)]
pub struct CurrentTracingSpan;

impl SpanSource for CurrentTracingSpan {
    fn active_span(&self) -> Option<Arc<dyn ActiveSpan>> {
        Some(Arc::new(TracingSpan::current()))
    }
}

/// Always hands out the same span.
#[derive(Clone)]
pub struct FixedSpan(pub Arc<dyn ActiveSpan>);

impl SpanSource for FixedSpan {
    fn active_span(&self) -> Option<Arc<dyn ActiveSpan>> {
        Some(self.0.clone())
    }
}

/// Keeps the active-context gauge balanced on every exit path.
struct ActiveContextGuard<'a> {
    metrics: &'a ContextFlowMetrics,
}

impl<'a> ActiveContextGuard<'a> {
    fn enter(metrics: &'a ContextFlowMetrics) -> Self {
        metrics.update_active_context_count(1);
        Self { metrics }
    }
}

impl Drop for ActiveContextGuard<'_> {
    fn drop(&mut self) {
        self.metrics.update_active_context_count(-1);
    }
}

/// Pipeline stage that observes context flow around the next handler.
pub struct ContextObservabilityMiddleware {
    config: Arc<ContextFlowConfig>,
    tracker: Arc<ContextFlowTracker>,
    metrics: Arc<ContextFlowMetrics>,
    enricher: ContextTraceEnricher,
    span_source: Arc<dyn SpanSource>,
    disposed: AtomicBool,
}

impl ContextObservabilityMiddleware {
    pub fn new(
        config: Arc<ContextFlowConfig>,
        tracker: Arc<ContextFlowTracker>,
        enricher: ContextTraceEnricher,
    ) -> Self {
        Self {
            metrics: tracker.metrics().clone(),
            config,
            tracker,
            enricher,
            span_source: Arc::new(CurrentTracingSpan),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_span_source(mut self, source: Arc<dyn SpanSource>) -> Self {
        self.span_source = source;
        self
    }

    /// Run `next` with before/after/error bookkeeping.
    ///
    /// Errors from `next` are returned unchanged. Integrity and size
    /// violations are returned as `E::from(ContextFlowError)` only when the
    /// matching fail-closed policy is on, and `next` is then never called.
    pub async fn invoke<M, R, E, F>(
        &self,
        message: &M,
        context: &mut MessageContext,
        cancel: CancellationToken,
        next: F,
    ) -> Result<R, E>
    where
        M: ?Sized + Sync,
        E: From<ContextFlowError> + fmt::Display,
        F: for<'c> FnOnce(&'c M, &'c mut MessageContext, CancellationToken) -> BoxFuture<'c, Result<R, E>>,
    {
        if !self.config.middleware.enabled || self.is_disposed() {
            return next(message, context, cancel).await;
        }

        let policy = &self.config.middleware;
        let stage = resolve_stage(context, &policy.default_stage);
        let before_stage = format!("{}:Before", stage);
        let after_stage = format!("{}:After", stage);

        // Checked against the context as received, before an id is assigned.
        let missing = if policy.validate_context_integrity {
            self.tracker.missing_required_fields(context)
        } else {
            Vec::new()
        };

        // Before, After and Error snapshots must share one message id.
        if context.message_id.is_none() {
            let generated = Uuid::new_v4().to_string();
            tracing::debug!(message_id = %generated, stage = %stage, "Assigned message id to context");
            context.message_id = Some(generated);
        }

        let _active = ActiveContextGuard::enter(&self.metrics);
        let span = self.span_source.active_span();
        let before = self.tracker.record_context_state(Some(context), &before_stage);

        if !missing.is_empty() {
            let message_id = context.message_id.clone().unwrap_or_default();
            tracing::warn!(message_id = %message_id, stage = %stage, missing = ?missing, "Context integrity check failed");
            self.metrics.record_validation_failure("missing_required_fields");
            self.emit(
                span.as_deref(),
                EVENT_INTEGRITY_FAILED,
                context,
                vec![("missing".to_string(), AttributeValue::String(missing.join(",")))],
            );
            if policy.fail_on_integrity_violation {
                return Err(E::from(ContextFlowError::IntegrityViolation {
                    message_id,
                    missing_fields: missing,
                }));
            }
        }

        let size_bytes = before.as_ref().map_or(0, |s| s.size_bytes);
        if size_bytes > policy.max_context_size_bytes {
            let message_id = context.message_id.clone().unwrap_or_default();
            tracing::warn!(
                message_id = %message_id,
                stage = %stage,
                size_bytes,
                max_bytes = policy.max_context_size_bytes,
                "Context size threshold exceeded"
            );
            self.metrics.record_size_threshold_exceeded(&stage, size_bytes);
            self.emit(
                span.as_deref(),
                EVENT_SIZE_EXCEEDED,
                context,
                vec![("size_bytes".to_string(), AttributeValue::Int(size_bytes as i64))],
            );
            if policy.fail_on_size_violation {
                return Err(E::from(ContextFlowError::SizeExceeded {
                    message_id,
                    size_bytes,
                    max_bytes: policy.max_context_size_bytes,
                }));
            }
        }

        self.enricher.enrich_span(span.as_deref(), Some(context));

        let started = Instant::now();
        let result = next(message, context, cancel).await;
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                self.tracker.record_context_state(Some(context), &after_stage);
                self.metrics.record_stage_latency(&stage, elapsed);
                self.metrics.record_preservation_success(&stage);

                if policy.store_mutations_in_context {
                    let changes: Vec<ContextChange> = self
                        .tracker
                        .detect_changes(context, &before_stage, &after_stage)
                        .map(Iterator::collect)
                        .unwrap_or_default();
                    self.apply_mutations(span.as_deref(), context, &stage, changes);
                }
                Ok(value)
            }
            Err(error) => {
                self.metrics.record_error("pipeline_exception", &stage);
                self.metrics.record_stage_latency(&stage, elapsed);
                tracing::debug!(message_id = ?context.message_id, stage = %stage, error = %error, "Pipeline stage failed");

                if policy.capture_error_states {
                    let mut metadata = BTreeMap::new();
                    metadata.insert("Error".to_string(), error.to_string());
                    if policy.include_stack_traces {
                        metadata.insert(
                            "StackTrace".to_string(),
                            std::backtrace::Backtrace::force_capture().to_string(),
                        );
                    }
                    self.tracker.record_context_state_with_metadata(
                        Some(context),
                        &format!("{}:Error", stage),
                        metadata,
                    );
                }
                self.emit(
                    span.as_deref(),
                    EVENT_PIPELINE_ERROR,
                    context,
                    vec![("error".to_string(), AttributeValue::String(error.to_string()))],
                );
                Err(error)
            }
        }
    }

    fn apply_mutations(
        &self,
        span: Option<&dyn ActiveSpan>,
        context: &mut MessageContext,
        stage: &str,
        changes: Vec<ContextChange>,
    ) {
        if changes.is_empty() {
            return;
        }

        let critical = &self.config.fields.critical_fields;
        let mut history = context
            .item(MUTATIONS_ITEM_KEY)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for change in changes {
            self.metrics.record_mutation(change.change_type, stage);

            let bare = change
                .field_name
                .strip_prefix(crate::context::fields::ITEM_PREFIX)
                .unwrap_or(&change.field_name);
            if critical.iter().any(|c| c == &change.field_name || c == bare) {
                tracing::warn!(
                    message_id = ?context.message_id,
                    stage,
                    field = %change.field_name,
                    change = %change.change_type,
                    "Critical context field mutated"
                );
                self.emit(
                    span,
                    EVENT_CRITICAL_FIELD_MUTATED,
                    context,
                    vec![
                        ("field".to_string(), AttributeValue::String(change.field_name.clone())),
                        ("change".to_string(), AttributeValue::from(change.change_type.as_str())),
                    ],
                );
            }

            match serde_json::to_value(&change) {
                Ok(value) => history.push(value),
                Err(e) => tracing::warn!(error = %e, "Failed to persist context mutation"),
            }
        }

        context.set_item(MUTATIONS_ITEM_KEY, serde_json::Value::Array(history));
    }

    fn emit(
        &self,
        span: Option<&dyn ActiveSpan>,
        name: &str,
        context: &MessageContext,
        attributes: EventAttributes,
    ) {
        if !self.config.middleware.emit_diagnostic_events {
            return;
        }
        if let Err(e) = self.enricher.add_context_event(span, name, context, attributes) {
            tracing::debug!(error = %e, "Diagnostic event dropped");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop observing; later invocations pass straight through. Idempotent.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Context observability middleware disposed");
        }
    }

    pub async fn dispose_async(&self) {
        self.dispose();
    }
}

/// Stage name from the pipeline-supplied item, else `default`.
fn resolve_stage(context: &MessageContext, default: &str) -> String {
    context
        .item(STAGE_ITEM_KEY)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(default)
        .to_string()
}
