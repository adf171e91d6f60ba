//! Message pipeline integration.
//!
//! # Data Flow
//! ```text
//! invoke(message, ctx, cancel, next)
//!     → disabled? call next directly
//!     → snapshot "<stage>:Before"
//!     → integrity + size policy (fail closed or record)
//!     → enrich active span
//!     → next(message, ctx, cancel)
//!         Ok  → snapshot "<stage>:After" → mutations → ctx item
//!         Err → snapshot "<stage>:Error" → error event → same Err
//! ```
//!
//! # Design Decisions
//! - Generic over the pipeline's error type; policy failures convert via `From`
//! - The active-context gauge is held by a guard so early returns stay balanced

pub mod middleware;

pub use middleware::{
    ContextObservabilityMiddleware, CurrentTracingSpan, FixedSpan, SpanSource,
    EVENT_CRITICAL_FIELD_MUTATED, EVENT_INTEGRITY_FAILED, EVENT_PIPELINE_ERROR,
    EVENT_SIZE_EXCEEDED,
};
