//! Shared fixtures for the integration tests.

use std::sync::Arc;

use context_flow::observability::{ContextTraceEnricher, RecordingSpan, RedactingSanitizer};
use context_flow::pipeline::FixedSpan;
use context_flow::{
    ContextFlowConfig, ContextFlowDiagnostics, ContextFlowError, ContextFlowMetrics, ContextFlowTracker,
    ContextObservabilityMiddleware, MessageContext,
};

/// Everything a pipeline test needs, wired the way an application would.
#[allow(dead_code)]
pub struct Stack {
    pub metrics: Arc<ContextFlowMetrics>,
    pub tracker: Arc<ContextFlowTracker>,
    pub diagnostics: ContextFlowDiagnostics,
    pub middleware: ContextObservabilityMiddleware,
    pub span: Arc<RecordingSpan>,
}

pub fn stack(config: ContextFlowConfig) -> Stack {
    let config = Arc::new(config);
    let metrics = Arc::new(ContextFlowMetrics::new());
    let tracker = Arc::new(ContextFlowTracker::new(config.clone(), metrics.clone()));
    let diagnostics = ContextFlowDiagnostics::new(tracker.clone(), metrics.clone(), config.clone());
    let sanitizer = RedactingSanitizer::new(config.fields.sensitive_patterns.iter());
    let enricher = ContextTraceEnricher::new(config.enricher.clone(), Arc::new(sanitizer));
    let span = Arc::new(RecordingSpan::new());
    let middleware = ContextObservabilityMiddleware::new(config, tracker.clone(), enricher)
        .with_span_source(Arc::new(FixedSpan(span.clone())));

    Stack {
        metrics,
        tracker,
        diagnostics,
        middleware,
        span,
    }
}

/// A well-populated order context.
#[allow(dead_code)]
pub fn order_context(message_id: &str, correlation_id: &str) -> MessageContext {
    MessageContext::new(message_id)
        .with_correlation_id(correlation_id)
        .with_message_type("OrderPlaced")
        .with_source("orders")
        .with_tenant_id("tenant-a")
        .with_user_id("user-1")
}

/// Application error type a pipeline would bring.
#[allow(dead_code)]
#[derive(Debug)]
pub enum AppError {
    Context(ContextFlowError),
    Handler(String),
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AppError::Context(e) => write!(f, "{}", e),
            AppError::Handler(e) => write!(f, "handler failed: {}", e),
        }
    }
}

impl From<ContextFlowError> for AppError {
    fn from(e: ContextFlowError) -> Self {
        AppError::Context(e)
    }
}
