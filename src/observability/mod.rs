//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! tracker / diagnostics / middleware produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (in-process aggregate + metrics facade)
//!     → enricher.rs → tracing.rs (span attributes, events, links)
//!
//! Consumers:
//!     → Log aggregation (stdout, JSON optional)
//!     → Metrics endpoint (Prometheus scrape, optional)
//!     → Baggage carriers on outgoing messages
//! ```
//!
//! # Design Decisions
//! - Metrics are cheap (atomic increments), summaries are read on demand
//! - Tenant, user and custom item values always pass through a sanitizer
//! - Spans are abstracted so tests can observe exactly what was written

pub mod enricher;
pub mod logging;
pub mod metrics;
pub mod sanitizer;
pub mod tracing;

pub use enricher::{BaggageCarrier, ContextTraceEnricher};
pub use logging::init_logging;
pub use metrics::{init_metrics, ContextFlowMetrics, ContextMetricsSummary};
pub use sanitizer::{PassthroughSanitizer, RedactingSanitizer, TagSanitizer, REDACTED};
pub use tracing::{ActiveSpan, AttributeValue, EventAttributes, RecordingSpan, TraceParent, TracingSpan};
