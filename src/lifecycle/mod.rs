//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Construction:
//!     tracker / diagnostics → spawn_sweeper (retention sweeps)
//!
//! Disposal (dispose / dispose_async):
//!     first call wins → cancel token → sweeper exits → maps cleared
//!     later calls → no-op
//! ```
//!
//! # Design Decisions
//! - One token type serves both disposal and pipeline cancellation
//! - Sweeps are optional: without a runtime, callers sweep manually

pub mod cancellation;
pub mod sweeper;

pub use cancellation::CancellationToken;
pub use sweeper::spawn_sweeper;
