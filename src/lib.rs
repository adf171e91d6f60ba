//! Context flow observability for message pipelines.

pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod pipeline;
pub mod tracking;

pub use config::schema::ContextFlowConfig;
pub use context::MessageContext;
pub use diagnostics::ContextFlowDiagnostics;
pub use error::{ContextFlowError, ContextFlowResult};
pub use lifecycle::CancellationToken;
pub use observability::metrics::ContextFlowMetrics;
pub use pipeline::ContextObservabilityMiddleware;
pub use tracking::ContextFlowTracker;
