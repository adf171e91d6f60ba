//! Context data model.
//!
//! # Data Flow
//! ```text
//! MessageContext (owned by the pipeline)
//!     → tracker captures ContextSnapshot (immutable)
//!     → snapshots stitched into ContextLineage (per correlation id)
//!     → snapshot pairs diffed into ContextChange records
//! ```
//!
//! # Design Decisions
//! - Snapshots are shared via `Arc` between the message and lineage indexes
//! - Reserved items (`ContextFlow.*`) never leak into snapshots
//! - Typed capabilities (validation/authorization results) are looked up by
//!   key and deserialized on demand, keeping the core decoupled from them

pub mod message;
pub mod snapshot;

pub use message::{
    fields, AuthorizationResult, MessageContext, ValidationResult, AUTHORIZATION_RESULT_KEY,
    MUTATIONS_ITEM_KEY, RESERVED_PREFIX, STAGE_ITEM_KEY, VALIDATION_RESULT_KEY,
};
pub use snapshot::{
    ChangeType, ContextChange, ContextLineage, ContextMutation, ContextSnapshot,
    ServiceBoundaryTransition,
};
