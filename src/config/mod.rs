//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ContextFlowConfig (validated, immutable)
//!     → shared via Arc to tracker, diagnostics, middleware, enricher
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use schema::ContextFlowConfig;
pub use schema::DiagnosticsConfig;
pub use schema::EnricherConfig;
pub use schema::FieldPolicyConfig;
pub use schema::MiddlewareConfig;
pub use schema::TelemetryConfig;
pub use schema::TrackerConfig;
