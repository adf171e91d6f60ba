//! Context flow tracking subsystem.
//!
//! # Data Flow
//! ```text
//! record_context_state(ctx, stage)
//!     → capture well-known fields + custom items (capped)
//!     → lock lineage (per correlation id) → append → FIFO trim
//!     → append to per-message snapshot list
//!     → metrics (snapshot, lineage depth)
//!
//! detect_changes(ctx, from, to)
//!     → latest snapshot per stage → SnapshotChanges (lazy)
//! ```
//!
//! # Design Decisions
//! - DashMap for the indexes, one mutex per lineage so unrelated
//!   correlation ids never contend
//! - Snapshot timestamps are taken under the lineage lock, so a lineage is
//!   always non-decreasing in time
//! - Evicted lineages are tombstoned; a writer holding a stale handle retries

pub mod changes;
pub mod tracker;

pub use changes::{diff_snapshots, SnapshotChanges};
pub use tracker::ContextFlowTracker;
